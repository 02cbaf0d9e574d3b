//! Test-only doubles and fixtures for pipeline tests.
//!
//! Scripted trial runners, fixers and operators return predetermined results
//! so orchestration can be tested without depending on real operations.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

use crate::core::fingerprint::DigestMap;
use crate::core::operation::Operation;
use crate::core::retention::RetentionPolicy;
use crate::core::router::Profile;
use crate::core::score::{ExecutionTrace, PostConditionResult};
use crate::core::types::{Candidate, SandboxAttempt, Task, TaskStatus};
use crate::heartbeat::{Heartbeat, HeartbeatParts, Pipeline};
use crate::io::jsonl::JsonlWriter;
use crate::io::kill_switch::FlagKillSwitch;
use crate::io::locks::ResourceLocks;
use crate::io::metrics::{CycleSummary, MetricsRecord, MetricsSink};
use crate::io::notifier::{Notification, Notifier};
use crate::io::operator::{OperationOutput, Operator, StateOperator};
use crate::io::quarantine::Quarantine;
use crate::io::snapshot::SnapshotStore;
use crate::io::state_store::{MemoryStateStore, StateStore};
use crate::io::task_source::TaskSource;
use crate::production::rollback::RollbackManager;
use crate::production::{ExecutorParts, ProductionExecutor};
use crate::sandbox::{FixGenerator, SandboxOrchestrator, TrialRunner, TrialOutput};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A pending task row.
pub fn task(id: &str, task_type: &str, payload: Value) -> Task {
    Task {
        id: id.to_string(),
        task_type: task_type.to_string(),
        status: TaskStatus::Pending,
        assigned_agent: None,
        payload,
        result: None,
    }
}

/// A trace that scores 100: no errors, one met post-condition, within budget.
pub fn clean_trace(time_budget_ms: u64) -> ExecutionTrace {
    ExecutionTrace {
        post_conditions: vec![PostConditionResult {
            description: "expected state".to_string(),
            met: true,
        }],
        elapsed_ms: 1,
        time_budget_ms,
        ..ExecutionTrace::default()
    }
}

/// Returns scripted traces in order, repeating the last once exhausted.
pub struct ScriptedTrialRunner {
    traces: Mutex<VecDeque<ExecutionTrace>>,
    last: Mutex<Option<ExecutionTrace>>,
    baseline: DigestMap,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedTrialRunner {
    pub fn new(traces: Vec<ExecutionTrace>) -> Self {
        Self {
            traces: Mutex::new(traces.into()),
            last: Mutex::new(None),
            baseline: DigestMap::new(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn repeating(trace: ExecutionTrace) -> Self {
        Self::new(vec![trace])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_baseline(mut self, baseline: DigestMap) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrialRunner for ScriptedTrialRunner {
    async fn trial(&self, _candidate: &Candidate) -> Result<TrialOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = locked(&self.traces).pop_front();
        let trace = match next {
            Some(trace) => {
                *locked(&self.last) = Some(trace.clone());
                trace
            }
            None => locked(&self.last)
                .clone()
                .ok_or_else(|| anyhow!("no scripted trace"))?,
        };
        Ok(TrialOutput {
            trace,
            baseline: self.baseline.clone(),
        })
    }
}

/// Always proposes a new candidate with a numbered note, unless told to give up.
#[derive(Default)]
pub struct ScriptedFixer {
    give_up: bool,
    calls: AtomicUsize,
}

impl ScriptedFixer {
    pub fn giving_up() -> Self {
        Self {
            give_up: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FixGenerator for ScriptedFixer {
    async fn propose(
        &self,
        candidate: &Candidate,
        _errors: &[String],
        history: &[SandboxAttempt],
    ) -> Result<Option<Candidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.give_up {
            return Ok(None);
        }
        Ok(Some(Candidate {
            iteration: candidate.iteration + 1,
            task_type: candidate.task_type.clone(),
            payload: candidate.payload.clone(),
            fix_note: Some(format!("scripted fix {}", history.len())),
        }))
    }
}

#[derive(Debug, Clone)]
pub enum OperatorScript {
    /// Delegate to [`StateOperator`].
    Apply,
    /// Write this content to the target instead of performing the operation.
    Overwrite(String),
    /// Corrupt the target, then fail.
    CorruptThenFail(String),
    /// Sleep, then apply.
    Delayed(Duration),
    /// Never finish.
    Hang,
}

/// Operator double that counts calls and records how many snapshots existed
/// at each call.
pub struct ScriptedOperator {
    script: OperatorScript,
    snapshots: Option<Arc<SnapshotStore>>,
    snapshots_seen: Mutex<Vec<usize>>,
    freeze_after: Option<Arc<FreezableStore>>,
    calls: AtomicUsize,
}

impl ScriptedOperator {
    pub fn new(script: OperatorScript) -> Self {
        Self {
            script,
            snapshots: None,
            snapshots_seen: Mutex::new(Vec::new()),
            freeze_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn observing(mut self, snapshots: Arc<SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Freeze `store` once the scripted step has run, so a later restore
    /// cannot take effect.
    pub fn freezing(mut self, store: Arc<FreezableStore>) -> Self {
        self.freeze_after = Some(store);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn snapshots_seen(&self) -> Vec<usize> {
        locked(&self.snapshots_seen).clone()
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn apply(
        &self,
        operation: &Operation,
        store: &dyn StateStore,
    ) -> Result<OperationOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(snapshots) = &self.snapshots {
            let count = snapshots.list()?.len();
            locked(&self.snapshots_seen).push(count);
        }
        let result = match &self.script {
            OperatorScript::Apply => StateOperator.apply(operation, store).await,
            OperatorScript::Overwrite(content) => store
                .write(operation.resource(), content.as_bytes())
                .map(|()| OperationOutput::Written {
                    bytes: content.len(),
                }),
            OperatorScript::CorruptThenFail(content) => store
                .write(operation.resource(), content.as_bytes())
                .and_then(|()| Err(anyhow!("operation crashed midway"))),
            OperatorScript::Delayed(delay) => {
                tokio::time::sleep(*delay).await;
                StateOperator.apply(operation, store).await
            }
            OperatorScript::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(anyhow!("hung operation woke up"))
            }
        };
        if let Some(store) = &self.freeze_after {
            store.freeze();
        }
        result
    }
}

/// Memory store whose writes are silently dropped once frozen.
#[derive(Default)]
pub struct FreezableStore {
    inner: MemoryStateStore,
    frozen: AtomicBool,
}

impl FreezableStore {
    pub fn new(inner: MemoryStateStore) -> Self {
        Self {
            inner,
            frozen: AtomicBool::new(false),
        }
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }
}

impl StateStore for FreezableStore {
    fn read(&self, resource: &str) -> Result<Option<Vec<u8>>> {
        self.inner.read(resource)
    }

    fn write(&self, resource: &str, contents: &[u8]) -> Result<()> {
        if self.is_frozen() {
            return Ok(());
        }
        self.inner.write(resource, contents)
    }

    fn remove(&self, resource: &str) -> Result<()> {
        if self.is_frozen() {
            return Ok(());
        }
        self.inner.remove(resource)
    }

    fn health_check(&self) -> Result<()> {
        self.inner.health_check()
    }
}

/// In-memory task table.
#[derive(Default)]
pub struct MemoryTaskSource {
    rows: Mutex<Vec<Task>>,
}

impl MemoryTaskSource {
    pub fn new(rows: Vec<Task>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        locked(&self.rows).iter().find(|t| t.id == id).cloned()
    }
}

impl TaskSource for MemoryTaskSource {
    fn pending(&self, limit: usize) -> Result<Vec<Task>> {
        Ok(locked(&self.rows)
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.task(id))
    }

    fn complete(&self, id: &str, status: TaskStatus, result: &str) -> Result<()> {
        let mut rows = locked(&self.rows);
        let row = rows
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        row.status = status;
        row.result = Some(result.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMetricsSink {
    tasks: Mutex<Vec<MetricsRecord>>,
    cycles: Mutex<Vec<CycleSummary>>,
}

impl MemoryMetricsSink {
    pub fn tasks(&self) -> Vec<MetricsRecord> {
        locked(&self.tasks).clone()
    }

    pub fn cycles(&self) -> Vec<CycleSummary> {
        locked(&self.cycles).clone()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record_task(&self, record: &MetricsRecord) -> Result<()> {
        locked(&self.tasks).push(record.clone());
        Ok(())
    }

    fn record_cycle(&self, summary: &CycleSummary) -> Result<()> {
        locked(&self.cycles).push(summary.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        locked(&self.sent).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        locked(&self.sent).push(notification.clone());
        Ok(())
    }
}

/// Limits and policy for a [`Harness`] pipeline.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    pub profile: Profile,
    pub max_sandbox_iterations: u32,
    pub sandbox_attempt_timeout: Duration,
    pub execution_timeout: Duration,
    pub batch_size: usize,
    pub retention: RetentionPolicy,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            profile: Profile::autonomous(),
            max_sandbox_iterations: 5,
            sandbox_attempt_timeout: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(600),
            batch_size: 3,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Fully wired pipeline over in-memory state and a temp directory.
pub struct Harness {
    pub temp: tempfile::TempDir,
    pub live: Arc<FreezableStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub quarantine: Arc<Quarantine>,
    pub kill_switch: Arc<FlagKillSwitch>,
    pub source: Arc<MemoryTaskSource>,
    pub metrics: Arc<MemoryMetricsSink>,
    pub notifier: Arc<RecordingNotifier>,
    pub locks: ResourceLocks,
    pub rollbacks_path: PathBuf,
}

impl Harness {
    pub fn new<I, K, V>(tasks: Vec<Task>, live_entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let temp = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let snapshots = Arc::new(SnapshotStore::new(temp.path().join("snapshots")));
        let quarantine = Arc::new(Quarantine::new(temp.path().join("quarantine.json")));
        let rollbacks_path = temp.path().join("rollbacks.jsonl");
        Self {
            live: Arc::new(FreezableStore::new(MemoryStateStore::from_entries(
                live_entries,
            ))),
            snapshots,
            quarantine,
            kill_switch: Arc::new(FlagKillSwitch::default()),
            source: Arc::new(MemoryTaskSource::new(tasks)),
            metrics: Arc::new(MemoryMetricsSink::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            locks: ResourceLocks::default(),
            rollbacks_path,
            temp,
        }
    }

    pub fn executor(&self, operator: Arc<dyn Operator>, timeout: Duration) -> ProductionExecutor {
        let live: Arc<dyn StateStore> = self.live.clone();
        ProductionExecutor::new(ExecutorParts {
            live: live.clone(),
            operator,
            snapshots: self.snapshots.clone(),
            rollback: Arc::new(RollbackManager::new(
                live,
                self.snapshots.clone(),
                Arc::new(JsonlWriter::new(&self.rollbacks_path)),
            )),
            locks: self.locks.clone(),
            quarantine: self.quarantine.clone(),
            kill_switch: self.kill_switch.clone(),
            timeout,
        })
    }

    pub fn pipeline(
        &self,
        runner: Arc<dyn TrialRunner>,
        fixer: Arc<dyn FixGenerator>,
        operator: Arc<dyn Operator>,
        settings: &HarnessSettings,
    ) -> Pipeline {
        Pipeline::new(
            settings.profile.clone(),
            SandboxOrchestrator::new(
                runner,
                fixer,
                settings.max_sandbox_iterations,
                settings.sandbox_attempt_timeout,
            ),
            self.executor(operator, settings.execution_timeout),
        )
    }

    pub fn heartbeat(
        &self,
        runner: Arc<dyn TrialRunner>,
        fixer: Arc<dyn FixGenerator>,
        operator: Arc<dyn Operator>,
        settings: &HarnessSettings,
    ) -> Heartbeat {
        Heartbeat::new(HeartbeatParts {
            pipeline: Arc::new(self.pipeline(runner, fixer, operator, settings)),
            source: self.source.clone(),
            metrics: self.metrics.clone(),
            notifier: self.notifier.clone(),
            kill_switch: self.kill_switch.clone(),
            snapshots: self.snapshots.clone(),
            quarantine: self.quarantine.clone(),
            retention: settings.retention,
            batch_size: settings.batch_size,
        })
    }

    /// Current live content of `resource` as UTF-8.
    pub fn live_text(&self, resource: &str) -> Option<String> {
        self.live
            .read(resource)
            .unwrap_or_else(|err| panic!("read {resource}: {err:#}"))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }
}
