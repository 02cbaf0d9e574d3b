//! Command implementations behind the `warden` binary.
//!
//! [`Workspace`] wires the filesystem-backed adapters for a project root.
//! The binary only parses arguments, prints and maps errors to exit codes.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::risk::assess;
use crate::core::router::{Profile, decide};
use crate::core::types::{Decision, RiskAssessment, Task, TaskDescriptor, TaskStatus};
use crate::error::PipelineError;
use crate::heartbeat::{Heartbeat, HeartbeatParts, Pipeline};
use crate::io::config::{WardenConfig, load_config};
use crate::io::jsonl::JsonlWriter;
use crate::io::kill_switch::{KillSwitch, SentinelKillSwitch};
use crate::io::locks::ResourceLocks;
use crate::io::metrics::JsonlMetricsSink;
use crate::io::notifier::LogNotifier;
use crate::io::operator::{Operator, StateOperator};
use crate::io::paths::WardenPaths;
use crate::io::quarantine::{Quarantine, QuarantineEntry};
use crate::io::snapshot::{Snapshot, SnapshotStore};
use crate::io::state_store::{FsStateStore, StateStore};
use crate::io::task_source::{JsonTaskStore, TaskSource};
use crate::production::rollback::{RollbackManager, RollbackReport, VerifyReport};
use crate::production::{ExecutorParts, ProductionExecutor};
use crate::sandbox::{IsolatedTrialRunner, RuleFixer, SandboxOrchestrator};

/// An initialized project root and its adapters.
pub struct Workspace {
    pub paths: WardenPaths,
    pub config: WardenConfig,
    live: Arc<dyn StateStore>,
    snapshots: Arc<SnapshotStore>,
    quarantine: Arc<Quarantine>,
    tasks: Arc<JsonTaskStore>,
    rollback: Arc<RollbackManager>,
    locks: ResourceLocks,
}

impl Workspace {
    /// Open `root`, which must already contain `.warden/`.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = WardenPaths::new(root);
        if !paths.warden_dir.is_dir() {
            return Err(anyhow!(
                "{} is not initialized (run `warden init`)",
                root.display()
            ));
        }
        let config = load_config(&paths.config_path)?;
        let live: Arc<dyn StateStore> = Arc::new(FsStateStore::new(config.workspace_path(root)));
        let snapshots = Arc::new(SnapshotStore::new(&paths.snapshots_dir));
        let rollback = Arc::new(RollbackManager::new(
            live.clone(),
            snapshots.clone(),
            Arc::new(JsonlWriter::new(&paths.rollbacks_path)),
        ));
        Ok(Self {
            quarantine: Arc::new(Quarantine::new(&paths.quarantine_path)),
            tasks: Arc::new(JsonTaskStore::new(&paths.tasks_path)),
            locks: ResourceLocks::default(),
            live,
            snapshots,
            rollback,
            config,
            paths,
        })
    }

    /// Heartbeat over the live workspace with the active profile.
    pub fn heartbeat(&self) -> Result<Heartbeat> {
        let config = &self.config;
        let profile = config.active_profile()?.clone();
        let operator: Arc<dyn Operator> = Arc::new(StateOperator);
        let kill_switch: Arc<dyn KillSwitch> = Arc::new(SentinelKillSwitch::new(
            config.kill_switch_path(&self.paths.root),
        ));

        let sandbox = SandboxOrchestrator::new(
            Arc::new(IsolatedTrialRunner::new(self.live.clone(), operator.clone())),
            Arc::new(RuleFixer),
            config.max_sandbox_iterations,
            config.sandbox_attempt_timeout(),
        );
        let executor = ProductionExecutor::new(ExecutorParts {
            live: self.live.clone(),
            operator,
            snapshots: self.snapshots.clone(),
            rollback: self.rollback.clone(),
            locks: self.locks.clone(),
            quarantine: self.quarantine.clone(),
            kill_switch: kill_switch.clone(),
            timeout: config.execution_timeout(),
        });

        Ok(Heartbeat::new(HeartbeatParts {
            pipeline: Arc::new(Pipeline::new(profile, sandbox, executor)),
            source: self.tasks.clone(),
            metrics: Arc::new(JsonlMetricsSink::new(
                JsonlWriter::new(&self.paths.metrics_path),
                JsonlWriter::new(&self.paths.cycles_path),
            )),
            notifier: Arc::new(LogNotifier),
            kill_switch,
            snapshots: self.snapshots.clone(),
            quarantine: self.quarantine.clone(),
            retention: config.retention,
            batch_size: config.max_concurrent_tasks,
        }))
    }

    pub fn profile(&self) -> Result<&Profile> {
        self.config.active_profile()
    }

    pub fn task(&self, id: &str) -> Result<Task> {
        self.tasks
            .get(id)?
            .ok_or_else(|| anyhow!("task {id} not found in {}", self.paths.tasks_path.display()))
    }

    /// Parse `payload` as JSON and append a pending task.
    pub fn enqueue(&self, task_type: &str, payload: &str) -> Result<String> {
        let payload: Value =
            serde_json::from_str(payload).context("parse --payload as JSON")?;
        let id = self.tasks.enqueue(task_type, payload)?;
        info!(task_id = %id, task_type, "task enqueued");
        Ok(id)
    }

    /// Put a copy of an escalated, failed or rolled-back task back in the
    /// queue. Returns the new task id.
    pub fn requeue(&self, id: &str) -> Result<String> {
        let new_id = self.tasks.requeue(id)?;
        info!(task_id = %id, requeued_as = %new_id, "task requeued");
        Ok(new_id)
    }

    /// Snapshots newest first, at most `limit` of them.
    pub fn snapshots(&self, limit: Option<usize>) -> Result<Vec<Snapshot>> {
        let mut all = self.snapshots.list()?;
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        Ok(all)
    }

    /// Restore a snapshot on operator request.
    ///
    /// The snapshot's resources are locked for the duration of the restore.
    /// A failed restore quarantines them; a verified one lifts any
    /// quarantine pinned to this snapshot.
    pub fn rollback(&self, snapshot_id: &str) -> Result<RollbackReport> {
        let snapshot = self.snapshots.load(snapshot_id)?;
        let covered = snapshot.covered();
        let _guard = self
            .locks
            .try_acquire(&covered)
            .map_err(PipelineError::ResourceBusy)?;

        match self
            .rollback
            .rollback(&snapshot.task_id, snapshot_id, "manual rollback")
        {
            Ok(report) => {
                for entry in self.quarantine.entries()? {
                    if entry.snapshot_id == snapshot_id {
                        self.quarantine.clear(&entry.resource)?;
                    }
                }
                Ok(report)
            }
            Err(err) => {
                let since = Utc::now();
                self.quarantine.add(
                    covered
                        .into_iter()
                        .map(|resource| QuarantineEntry {
                            resource,
                            task_id: snapshot.task_id.clone(),
                            snapshot_id: snapshot_id.to_string(),
                            reason: err.to_string(),
                            since,
                        })
                        .collect(),
                )?;
                Err(err.into())
            }
        }
    }

    pub fn verify(&self, snapshot_id: &str) -> Result<VerifyReport> {
        self.rollback.verify(snapshot_id)
    }

    /// Apply the retention policy now; returns the deleted snapshot ids.
    pub fn gc(&self) -> Result<Vec<String>> {
        let pinned = self.quarantine.pinned_snapshots()?;
        let collected =
            self.snapshots
                .collect_garbage(&self.config.retention, Utc::now(), &pinned)?;
        if !pinned.is_empty() {
            warn!(pinned = pinned.len(), "quarantined snapshots kept");
        }
        Ok(collected)
    }

    pub fn quarantined(&self) -> Result<Vec<QuarantineEntry>> {
        self.quarantine.entries()
    }

    pub fn clear_quarantine(&self, resource: &str) -> Result<()> {
        if !self.quarantine.clear(resource)? {
            return Err(anyhow!("{resource} is not quarantined"));
        }
        info!(resource, "quarantine cleared");
        Ok(())
    }
}

fn adhoc_id() -> String {
    "adhoc".to_string()
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A task described in a standalone JSON file. Only the type is required.
#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default = "adhoc_id")]
    id: String,
    #[serde(alias = "type")]
    task_type: String,
    #[serde(default = "empty_payload")]
    payload: Value,
}

/// Read a task from a JSON file for `score`/`decide --file`.
pub fn read_task_file(path: &Path) -> Result<Task> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file: TaskFile =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    if !file.payload.is_object() {
        return Err(anyhow!("{}: payload must be a JSON object", path.display()));
    }
    Ok(Task {
        id: file.id,
        task_type: file.task_type,
        status: TaskStatus::Pending,
        assigned_agent: None,
        payload: file.payload,
        result: None,
    })
}

pub fn score_task(task: &Task) -> RiskAssessment {
    assess(&task.id, &TaskDescriptor::from_task(task))
}

/// Score and route a task without running it.
pub fn decide_task(
    task: &Task,
    sandbox_score: Option<u8>,
    profile: &Profile,
) -> (RiskAssessment, Decision) {
    let assessment = score_task(task);
    let decision = decide(&task.id, assessment.level, sandbox_score, profile);
    (assessment, decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DecisionOutcome, RiskLevel};
    use crate::io::paths::{InitOptions, init_warden};

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let temp = tempfile::tempdir().expect("tempdir");
        init_warden(temp.path(), &InitOptions { force: false }).expect("init");
        let ws = Workspace::open(temp.path()).expect("open");
        (temp, ws)
    }

    fn write_live(temp: &tempfile::TempDir, name: &str, contents: &str) {
        fs::write(temp.path().join("workspace").join(name), contents).expect("write live");
    }

    fn read_live(temp: &tempfile::TempDir, name: &str) -> String {
        fs::read_to_string(temp.path().join("workspace").join(name)).expect("read live")
    }

    #[test]
    fn open_requires_init() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = Workspace::open(temp.path()).err().expect("uninitialized");
        assert!(err.to_string().contains("warden init"));
    }

    #[test]
    fn enqueue_then_lookup() {
        let (_temp, ws) = workspace();
        let id = ws
            .enqueue("db_query", r#"{"table": "users"}"#)
            .expect("enqueue");
        let task = ws.task(&id).expect("task");
        assert_eq!(task.task_type, "db_query");
        assert_eq!(task.status, TaskStatus::Pending);

        assert!(ws.enqueue("db_query", "not json").is_err());
        assert!(ws.enqueue("db_query", "[1, 2]").is_err());
        assert!(ws.task("missing").is_err());
    }

    #[test]
    fn requeue_only_accepts_finished_tasks_needing_retry() {
        let (_temp, ws) = workspace();
        let id = ws
            .enqueue("file_write", r#"{"path": "a.txt", "content": "x"}"#)
            .expect("enqueue");
        assert!(ws.requeue(&id).is_err());

        ws.tasks
            .complete(&id, TaskStatus::Failed, "operation crashed")
            .expect("complete");
        let again = ws.requeue(&id).expect("requeue");
        assert_eq!(ws.task(&again).expect("copy").status, TaskStatus::Pending);
        assert_eq!(ws.task(&id).expect("original").status, TaskStatus::Failed);
    }

    #[test]
    fn task_file_accepts_type_alias_and_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("task.json");
        fs::write(&path, r#"{"type": "send_email"}"#).expect("write");

        let task = read_task_file(&path).expect("task");
        assert_eq!(task.id, "adhoc");
        assert_eq!(task.task_type, "send_email");
        assert!(task.payload.as_object().is_some_and(serde_json::Map::is_empty));

        let (assessment, decision) = decide_task(&task, None, &Profile::autonomous());
        assert_eq!(assessment.score, 86);
        assert_eq!(assessment.level, RiskLevel::Critical);
        assert_eq!(decision.outcome, DecisionOutcome::Block);
    }

    #[test]
    fn decide_uses_supplied_sandbox_score() {
        let task = Task {
            id: "t".to_string(),
            task_type: "db_update".to_string(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            payload: empty_payload(),
            result: None,
        };
        let profile = Profile::autonomous();
        let (_, low) = decide_task(&task, Some(72), &profile);
        assert_eq!(low.outcome, DecisionOutcome::EscalateHuman);
        let (_, high) = decide_task(&task, Some(95), &profile);
        assert_eq!(high.outcome, DecisionOutcome::ConditionalExecute);
    }

    #[test]
    fn manual_rollback_restores_and_verifies() {
        let (temp, ws) = workspace();
        write_live(&temp, "notes.txt", "before");
        let snapshot = ws
            .snapshots
            .capture("task-1", &["notes.txt".to_string()], ws.live.as_ref())
            .expect("capture");
        write_live(&temp, "notes.txt", "after");

        let drift = ws.verify(&snapshot.id).expect("verify");
        assert!(!drift.matches);
        assert_eq!(drift.drifted, vec!["notes.txt".to_string()]);

        let report = ws.rollback(&snapshot.id).expect("rollback");
        assert_eq!(report.restored, vec!["notes.txt".to_string()]);
        assert_eq!(read_live(&temp, "notes.txt"), "before");
        assert!(ws.verify(&snapshot.id).expect("verify").matches);
    }

    #[test]
    fn successful_rollback_lifts_matching_quarantine() {
        let (temp, ws) = workspace();
        write_live(&temp, "a.txt", "v1");
        let snapshot = ws
            .snapshots
            .capture("task-1", &["a.txt".to_string()], ws.live.as_ref())
            .expect("capture");
        ws.quarantine
            .add(vec![QuarantineEntry {
                resource: "a.txt".to_string(),
                task_id: "task-1".to_string(),
                snapshot_id: snapshot.id.clone(),
                reason: "earlier restore failed".to_string(),
                since: Utc::now(),
            }])
            .expect("quarantine");

        ws.rollback(&snapshot.id).expect("rollback");
        assert!(ws.quarantined().expect("entries").is_empty());
    }

    #[test]
    fn rollback_of_unknown_snapshot_fails() {
        let (_temp, ws) = workspace();
        assert!(ws.rollback("no-such-snapshot").is_err());
        assert!(ws.verify("no-such-snapshot").is_err());
    }

    #[test]
    fn snapshot_listing_honours_limit() {
        let (temp, ws) = workspace();
        write_live(&temp, "a.txt", "x");
        for task in ["t1", "t2", "t3"] {
            ws.snapshots
                .capture(task, &["a.txt".to_string()], ws.live.as_ref())
                .expect("capture");
        }
        assert_eq!(ws.snapshots(None).expect("list").len(), 3);
        assert_eq!(ws.snapshots(Some(2)).expect("list").len(), 2);
    }

    #[test]
    fn clearing_unknown_quarantine_is_an_error() {
        let (_temp, ws) = workspace();
        assert!(ws.clear_quarantine("nothing.txt").is_err());
        assert!(ws.gc().expect("gc").is_empty());
    }

    #[test]
    fn heartbeat_builds_from_default_config() {
        let (_temp, ws) = workspace();
        assert!(ws.heartbeat().is_ok());
        assert_eq!(ws.profile().expect("profile"), &Profile::autonomous());
    }
}
