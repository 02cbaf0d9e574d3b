//! Task discovery and write-back.
//!
//! The core reads only `pending` rows and writes back status plus rationale.
//! The local store is a JSON array validated against a bundled schema on
//! every load.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use uuid::Uuid;

use crate::core::types::{Task, TaskStatus};

const TASKS_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/tasks/v1.schema.json"
));

pub trait TaskSource: Send + Sync {
    /// Up to `limit` pending tasks, in table order.
    fn pending(&self, limit: usize) -> Result<Vec<Task>>;
    fn get(&self, id: &str) -> Result<Option<Task>>;
    /// Record the task's status after a cycle, with its rationale.
    fn complete(&self, id: &str, status: TaskStatus, result: &str) -> Result<()>;
}

#[derive(Debug)]
pub struct JsonTaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Result<Vec<Task>> {
        load_tasks(&self.path)
    }

    /// Append a new pending task and return its id.
    pub fn enqueue(&self, task_type: &str, payload: Value) -> Result<String> {
        if !payload.is_object() {
            return Err(anyhow!("task payload must be a JSON object"));
        }
        let _guard = self.guard()?;
        let mut tasks = load_tasks(&self.path)?;
        let id = Uuid::new_v4().to_string();
        tasks.push(Task {
            id: id.clone(),
            task_type: task_type.to_string(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            payload,
            result: None,
        });
        write_tasks(&self.path, &tasks)?;
        Ok(id)
    }

    /// Append a pending copy of a finished task so it runs again. The
    /// original row keeps its terminal status. Only escalated, failed and
    /// rolled-back tasks may be requeued.
    pub fn requeue(&self, id: &str) -> Result<String> {
        let _guard = self.guard()?;
        let mut tasks = load_tasks(&self.path)?;
        let original = tasks
            .iter()
            .find(|task| task.id == id)
            .ok_or_else(|| anyhow!("task {id} not found in {}", self.path.display()))?;
        if !matches!(
            original.status,
            TaskStatus::Escalated | TaskStatus::Failed | TaskStatus::RolledBack
        ) {
            return Err(anyhow!(
                "task {id} is {}; only escalated, failed or rolled_back tasks can be requeued",
                original.status
            ));
        }
        let copy = Task {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            result: None,
            ..original.clone()
        };
        let new_id = copy.id.clone();
        tasks.push(copy);
        write_tasks(&self.path, &tasks)?;
        Ok(new_id)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("task store lock poisoned"))
    }
}

impl TaskSource for JsonTaskStore {
    fn pending(&self, limit: usize) -> Result<Vec<Task>> {
        let _guard = self.guard()?;
        Ok(load_tasks(&self.path)?
            .into_iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .take(limit)
            .collect())
    }

    fn get(&self, id: &str) -> Result<Option<Task>> {
        let _guard = self.guard()?;
        Ok(load_tasks(&self.path)?.into_iter().find(|task| task.id == id))
    }

    fn complete(&self, id: &str, status: TaskStatus, result: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut tasks = load_tasks(&self.path)?;
        let task = tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| anyhow!("task {id} not found in {}", self.path.display()))?;
        task.status = status;
        task.result = Some(result.to_string());
        write_tasks(&self.path, &tasks)
    }
}

/// Load and validate the task table. A missing file is an empty table.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_schema(&value)?;
    let tasks: Vec<Task> = serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", path.display()))?;

    let mut seen = BTreeSet::new();
    for task in &tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(anyhow!("duplicate task id {} in {}", task.id, path.display()));
        }
    }
    Ok(tasks)
}

fn write_tasks(path: &Path, tasks: &[Task]) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(tasks)?;
    buf.push('\n');
    super::write_atomic(path, buf.as_bytes())
}

fn validate_schema(tasks: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(TASKS_SCHEMA).context("parse bundled task schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(tasks) {
        let messages = compiled
            .iter_errors(tasks)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "task table schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
