//! One control-loop cycle: discover, score, route, validate, execute, record.
//!
//! Each task runs through its own [`Pipeline::process`] call on the tokio
//! runtime. A failure inside one task ends that task `failed` and never
//! aborts the cycle.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::core::retention::RetentionPolicy;
use crate::core::risk::assess;
use crate::core::router::{Profile, decide};
use crate::core::status::Lifecycle;
use crate::core::types::{
    Candidate, Decision, DecisionOutcome, RiskAssessment, Task, TaskDescriptor, TaskStatus,
};
use crate::exit_codes;
use crate::io::kill_switch::KillSwitch;
use crate::io::metrics::{CycleSummary, MetricsRecord, MetricsSink};
use crate::io::notifier::{Notification, Notifier};
use crate::io::quarantine::Quarantine;
use crate::io::snapshot::SnapshotStore;
use crate::io::task_source::TaskSource;
use crate::production::{ExecutionReport, ExecutionRequest, ProductionExecutor};
use crate::sandbox::{SandboxOrchestrator, SandboxReport};

/// Everything that happened to one task in one cycle.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub task_type: String,
    pub assessment: RiskAssessment,
    pub decision: Option<Decision>,
    pub sandbox: Option<SandboxReport>,
    pub execution: Option<ExecutionReport>,
    pub trail: Vec<TaskStatus>,
    pub final_status: TaskStatus,
    pub rationale: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TaskReport {
    pub fn metrics(&self, cycle_id: &str) -> MetricsRecord {
        let execution = self.execution.as_ref();
        MetricsRecord {
            cycle_id: cycle_id.to_string(),
            task_id: self.task_id.clone(),
            task_type: self.task_type.clone(),
            risk_score: self.assessment.score,
            risk_level: self.assessment.level,
            decision: self.decision.as_ref().map(|d| d.outcome),
            sandbox_iterations: self.sandbox.as_ref().map_or(0, SandboxReport::iterations),
            sandbox_score: self.sandbox.as_ref().map(SandboxReport::best_score),
            execution_outcome: execution.map(|e| e.record.outcome),
            final_status: self.final_status,
            snapshot_id: execution.and_then(|e| e.record.snapshot_id.clone()),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    fn notification(&self) -> Notification {
        Notification {
            task_id: self.task_id.clone(),
            task_type: self.task_type.clone(),
            status: self.final_status,
            rationale: self.rationale.clone(),
            target: self
                .decision
                .as_ref()
                .and_then(|d| d.escalation_target.clone()),
        }
    }
}

/// Scorer, router, sandbox and executor for a single task.
pub struct Pipeline {
    profile: Profile,
    sandbox: SandboxOrchestrator,
    executor: ProductionExecutor,
}

impl Pipeline {
    pub fn new(
        profile: Profile,
        sandbox: SandboxOrchestrator,
        executor: ProductionExecutor,
    ) -> Self {
        Self {
            profile,
            sandbox,
            executor,
        }
    }

    #[instrument(skip_all, fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn process(&self, task: Task, dry_run: bool) -> TaskReport {
        let started_at = Utc::now();
        let assessment = assess(&task.id, &TaskDescriptor::from_task(&task));
        info!(score = assessment.score, level = %assessment.level, "task scored");

        let mut report = TaskReport {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            assessment,
            decision: None,
            sandbox: None,
            execution: None,
            trail: Vec::new(),
            final_status: TaskStatus::Pending,
            rationale: String::new(),
            started_at,
            ended_at: started_at,
        };
        let mut life = Lifecycle::new();

        match self.drive(&task, dry_run, &mut life, &mut report).await {
            Ok(()) => report.final_status = life.status(),
            Err(err) => {
                error!(error = %format!("{err:#}"), "task failed internally");
                life.fail();
                report.final_status = TaskStatus::Failed;
                report.rationale = format!("internal error: {err:#}");
            }
        }
        report.trail = life.trail().to_vec();
        report.ended_at = Utc::now();
        info!(status = %report.final_status, rationale = %report.rationale, "task finished");
        report
    }

    async fn drive(
        &self,
        task: &Task,
        dry_run: bool,
        life: &mut Lifecycle,
        report: &mut TaskReport,
    ) -> Result<()> {
        let level = report.assessment.level;
        life.advance(TaskStatus::Scoring)?;
        life.advance(TaskStatus::Routing)?;

        let initial = decide(&task.id, level, None, &self.profile);
        report.decision = Some(initial.clone());
        if !initial.outcome.executes() {
            let status = match initial.outcome {
                DecisionOutcome::Block => TaskStatus::Blocked,
                _ => TaskStatus::Escalated,
            };
            life.advance(status)?;
            report.rationale = initial.rationale;
            return Ok(());
        }
        let threshold = initial
            .sandbox_threshold
            .context("executing decision carries no sandbox threshold")?;

        life.advance(TaskStatus::Sandboxed)?;
        let sandbox = self
            .sandbox
            .run(&task.id, Candidate::from_task(task), threshold)
            .await;
        let routed = decide(&task.id, level, Some(sandbox.best_score()), &self.profile);
        report.decision = Some(routed.clone());
        let attempts = sandbox.iterations();
        let passed = sandbox.passed();
        report.sandbox = Some(sandbox);
        if !routed.outcome.executes() || !passed {
            life.advance(TaskStatus::Escalated)?;
            report.rationale = format!("{} after {attempts} sandbox attempt(s)", routed.rationale);
            return Ok(());
        }

        life.advance(TaskStatus::Approved)?;
        let sandbox = report
            .sandbox
            .as_ref()
            .context("sandbox report missing after approval")?;
        let execution = self
            .executor
            .execute(&ExecutionRequest {
                task_id: &task.id,
                level,
                decision: &routed,
                sandbox,
                dry_run,
            })
            .await?;

        match execution.outcome.task_status() {
            TaskStatus::Approved => {}
            next @ (TaskStatus::Pending | TaskStatus::Escalated | TaskStatus::Failed) => {
                life.advance(next)?;
            }
            next => {
                life.advance(TaskStatus::Executing)?;
                life.advance(next)?;
            }
        }
        report.rationale = execution.outcome.rationale();
        report.execution = Some(execution);
        Ok(())
    }
}

/// Collaborators of a [`Heartbeat`].
pub struct HeartbeatParts {
    pub pipeline: Arc<Pipeline>,
    pub source: Arc<dyn TaskSource>,
    pub metrics: Arc<dyn MetricsSink>,
    pub notifier: Arc<dyn Notifier>,
    pub kill_switch: Arc<dyn KillSwitch>,
    pub snapshots: Arc<SnapshotStore>,
    pub quarantine: Arc<Quarantine>,
    pub retention: RetentionPolicy,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub summary: CycleSummary,
    pub reports: Vec<TaskReport>,
}

impl CycleOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.summary.halted {
            exit_codes::HALTED
        } else if self.summary.rollback_failed > 0 {
            exit_codes::ROLLBACK_FAILED
        } else {
            exit_codes::OK
        }
    }
}

pub struct Heartbeat {
    parts: HeartbeatParts,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl Heartbeat {
    pub fn new(parts: HeartbeatParts) -> Self {
        Self { parts }
    }

    /// Run one cycle. Dry-run simulates commits and writes nothing back.
    #[instrument(skip_all, fields(dry_run = dry_run))]
    pub async fn run_cycle(&self, dry_run: bool) -> Result<CycleOutcome> {
        let parts = &self.parts;
        let started = Instant::now();
        let mut summary = CycleSummary {
            cycle_id: Uuid::new_v4().to_string(),
            dry_run,
            ..CycleSummary::default()
        };

        if parts.kill_switch.engaged() {
            warn!("kill-switch engaged; cycle halted before reading tasks");
            summary.halted = true;
            summary.duration_ms = elapsed_ms(started);
            if !dry_run {
                parts.metrics.record_cycle(&summary)?;
            }
            return Ok(CycleOutcome {
                summary,
                reports: Vec::new(),
            });
        }

        let tasks = parts.source.pending(parts.batch_size)?;
        summary.discovered = tasks.len();
        info!(cycle_id = %summary.cycle_id, discovered = tasks.len(), "cycle started");

        let mut set = JoinSet::new();
        for task in tasks {
            let pipeline = Arc::clone(&parts.pipeline);
            set.spawn(async move { pipeline.process(task, dry_run).await });
        }
        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!(error = %err, "task pipeline panicked"),
            }
        }
        reports.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        for report in &reports {
            summary.count(report.final_status);
        }

        if !dry_run {
            for report in &reports {
                if !self.record(&summary.cycle_id, report) {
                    summary.write_back_failures += 1;
                }
            }
            if summary.rollback_failed > 0 || parts.kill_switch.engaged() {
                warn!("rollback failure or kill-switch engaged; snapshot gc skipped");
            } else {
                let pinned = parts.quarantine.pinned_snapshots()?;
                match parts
                    .snapshots
                    .collect_garbage(&parts.retention, Utc::now(), &pinned)
                {
                    Ok(collected) => summary.snapshots_collected = collected.len(),
                    Err(err) => warn!(error = %format!("{err:#}"), "snapshot gc failed"),
                }
            }
        }

        summary.duration_ms = elapsed_ms(started);
        if !dry_run {
            parts.metrics.record_cycle(&summary)?;
        }
        info!(
            cycle_id = %summary.cycle_id,
            succeeded = summary.succeeded,
            escalated = summary.escalated,
            blocked = summary.blocked,
            rolled_back = summary.rolled_back,
            deferred = summary.deferred,
            write_back_failures = summary.write_back_failures,
            "cycle finished"
        );
        Ok(CycleOutcome { summary, reports })
    }

    /// Write-back, metrics and notification for one task. Failures are
    /// logged so the remaining tasks are still recorded. Returns false when
    /// the status could not be written back.
    fn record(&self, cycle_id: &str, report: &TaskReport) -> bool {
        let parts = &self.parts;
        let complete = || {
            parts
                .source
                .complete(&report.task_id, report.final_status, &report.rationale)
        };
        let written = match complete() {
            Ok(()) => true,
            Err(err) => {
                warn!(task_id = %report.task_id, error = %format!("{err:#}"), "task write-back failed; retrying");
                match complete() {
                    Ok(()) => true,
                    Err(err) => {
                        error!(
                            task_id = %report.task_id,
                            status = %report.final_status,
                            error = %format!("{err:#}"),
                            "task write-back failed; task stays pending"
                        );
                        false
                    }
                }
            }
        };
        if let Err(err) = parts.metrics.record_task(&report.metrics(cycle_id)) {
            error!(task_id = %report.task_id, error = %format!("{err:#}"), "metrics write failed");
        }
        if report.final_status.needs_attention() {
            if let Err(err) = parts.notifier.notify(&report.notification()) {
                error!(task_id = %report.task_id, error = %format!("{err:#}"), "notification failed");
            }
        }
        written
    }
}
