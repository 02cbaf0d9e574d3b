//! Production execution under snapshot-and-rollback protection.
//!
//! Protocol for a cleared task:
//!
//! 1. pre-flight (quarantine, lock, health, existence, baseline)
//! 2. kill-switch sample
//! 3. snapshot every covered resource
//! 4. apply the operation under a hard timeout
//! 5. post-flight verification
//! 6. on failure at 4 or 5, restore the snapshot and verify the restore
//!
//! Dry-run stops after step 2.

pub mod postflight;
pub mod preflight;
pub mod rollback;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::core::operation::plan;
use crate::core::types::{
    Decision, ExecutionRecord, ExecutionStatus, RiskLevel, TaskStatus,
};
use crate::error::PipelineError;
use crate::io::kill_switch::KillSwitch;
use crate::io::locks::ResourceLocks;
use crate::io::operator::{OperationOutput, Operator};
use crate::io::quarantine::{Quarantine, QuarantineEntry};
use crate::io::snapshot::SnapshotStore;
use crate::io::state_store::StateStore;
use crate::sandbox::SandboxReport;

use self::preflight::PreflightContext;
use self::rollback::RollbackManager;

pub struct ExecutionRequest<'a> {
    pub task_id: &'a str,
    pub level: RiskLevel,
    pub decision: &'a Decision,
    pub sandbox: &'a SandboxReport,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded,
    Simulated,
    /// Stopped before any mutation.
    Aborted(PipelineError),
    RolledBack {
        cause: PipelineError,
    },
    RollbackFailed {
        cause: PipelineError,
        failure: PipelineError,
        /// False when the quarantine entry could not be persisted and the
        /// kill-switch was tripped in its place.
        quarantined: bool,
    },
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Succeeded => ExecutionStatus::Succeeded,
            Self::Simulated => ExecutionStatus::Simulated,
            Self::Aborted(_) => ExecutionStatus::Aborted,
            Self::RolledBack { .. } => ExecutionStatus::RolledBack,
            Self::RollbackFailed { .. } => ExecutionStatus::RollbackFailed,
        }
    }

    /// Task status this outcome leads to from `approved`.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Self::Succeeded => TaskStatus::Succeeded,
            Self::Simulated => TaskStatus::Approved,
            Self::Aborted(err) if err.is_deferrable() => TaskStatus::Pending,
            Self::Aborted(PipelineError::Preflight(_)) => TaskStatus::Escalated,
            Self::Aborted(_) => TaskStatus::Failed,
            Self::RolledBack { .. } => TaskStatus::RolledBack,
            Self::RollbackFailed { .. } => TaskStatus::RollbackFailed,
        }
    }

    pub fn rationale(&self) -> String {
        match self {
            Self::Succeeded => "executed; post-conditions verified".to_string(),
            Self::Simulated => "dry-run: pre-flight passed, commit simulated".to_string(),
            Self::Aborted(err) if err.is_deferrable() => format!("deferred: {err}"),
            Self::Aborted(err) => format!("aborted before commit: {err}"),
            Self::RolledBack { cause } => format!("{cause}; snapshot restored and verified"),
            Self::RollbackFailed {
                cause,
                failure,
                quarantined: true,
            } => {
                format!("{cause}; {failure}; resources quarantined, manual intervention required")
            }
            Self::RollbackFailed {
                cause,
                failure,
                quarantined: false,
            } => format!(
                "{cause}; {failure}; quarantine not recorded, kill-switch tripped, manual intervention required"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub record: ExecutionRecord,
    pub output: Option<OperationOutput>,
}

pub struct ProductionExecutor {
    live: Arc<dyn StateStore>,
    operator: Arc<dyn Operator>,
    snapshots: Arc<SnapshotStore>,
    rollback: Arc<RollbackManager>,
    locks: ResourceLocks,
    quarantine: Arc<Quarantine>,
    kill_switch: Arc<dyn KillSwitch>,
    timeout: Duration,
}

/// Collaborators of a [`ProductionExecutor`].
pub struct ExecutorParts {
    pub live: Arc<dyn StateStore>,
    pub operator: Arc<dyn Operator>,
    pub snapshots: Arc<SnapshotStore>,
    pub rollback: Arc<RollbackManager>,
    pub locks: ResourceLocks,
    pub quarantine: Arc<Quarantine>,
    pub kill_switch: Arc<dyn KillSwitch>,
    pub timeout: Duration,
}

fn clearance(request: &ExecutionRequest<'_>) -> Result<(), PipelineError> {
    if request.level == RiskLevel::Critical {
        return Err(PipelineError::Preflight(
            "CRITICAL-level tasks are never executed".to_string(),
        ));
    }
    if !request.decision.outcome.executes() {
        return Err(PipelineError::Preflight(format!(
            "decision {} does not clear execution",
            request.decision.outcome
        )));
    }
    if !request.sandbox.passed() {
        return Err(PipelineError::Preflight(
            "no sandbox PASS recorded".to_string(),
        ));
    }
    Ok(())
}

impl ProductionExecutor {
    pub fn new(parts: ExecutorParts) -> Self {
        Self {
            live: parts.live,
            operator: parts.operator,
            snapshots: parts.snapshots,
            rollback: parts.rollback,
            locks: parts.locks,
            quarantine: parts.quarantine,
            kill_switch: parts.kill_switch,
            timeout: parts.timeout,
        }
    }

    /// Commit the sandbox-approved candidate.
    ///
    /// `Err` is reserved for infrastructure failures the protocol cannot
    /// classify; every protocol outcome is an [`ExecutionOutcome`].
    #[instrument(skip_all, fields(task_id = %request.task_id, dry_run = request.dry_run))]
    pub async fn execute(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionReport> {
        let started_at = Utc::now();
        let finish = |outcome: ExecutionOutcome,
                      snapshot_id: Option<String>,
                      output: Option<OperationOutput>| {
            let rollback_triggered = matches!(
                outcome,
                ExecutionOutcome::RolledBack { .. } | ExecutionOutcome::RollbackFailed { .. }
            );
            ExecutionReport {
                record: ExecutionRecord {
                    task_id: request.task_id.to_string(),
                    snapshot_id,
                    started_at,
                    ended_at: Utc::now(),
                    outcome: outcome.status(),
                    rollback_triggered,
                },
                outcome,
                output,
            }
        };

        if let Err(err) = clearance(request) {
            return Ok(finish(ExecutionOutcome::Aborted(err), None, None));
        }
        let candidate = &request.sandbox.candidate;
        let plan = match plan(&candidate.task_type, &candidate.payload) {
            Ok(plan) => plan,
            Err(err) => {
                let err = PipelineError::Preflight(err.to_string());
                return Ok(finish(ExecutionOutcome::Aborted(err), None, None));
            }
        };

        let preflight = preflight::run(&PreflightContext {
            plan: &plan,
            live: self.live.as_ref(),
            locks: &self.locks,
            quarantine: &self.quarantine,
            baseline: &request.sandbox.baseline,
        });
        let _guard = match preflight {
            Ok(guard) => guard,
            Err(err) => {
                warn!(error = %err, "pre-flight failed");
                return Ok(finish(ExecutionOutcome::Aborted(err), None, None));
            }
        };

        if self.kill_switch.engaged() {
            warn!("kill-switch engaged before commit");
            return Ok(finish(
                ExecutionOutcome::Aborted(PipelineError::Cancelled),
                None,
                None,
            ));
        }
        if request.dry_run {
            return Ok(finish(ExecutionOutcome::Simulated, None, None));
        }

        let snapshot = self
            .snapshots
            .capture(request.task_id, &plan.resources, self.live.as_ref());
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let err = PipelineError::Execution(format!("snapshot capture failed: {err:#}"));
                return Ok(finish(ExecutionOutcome::Aborted(err), None, None));
            }
        };

        let applied = tokio::time::timeout(
            self.timeout,
            self.operator.apply(&plan.operation, self.live.as_ref()),
        )
        .await;
        let (cause, output) = match applied {
            Ok(Ok(output)) => match postflight::verify(&plan, self.live.as_ref()) {
                Ok(()) => (None, Some(output)),
                Err(err) => (Some(err), Some(output)),
            },
            Ok(Err(err)) => (Some(PipelineError::Execution(format!("{err:#}"))), None),
            Err(_) => (
                Some(PipelineError::Execution(format!(
                    "operation timed out after {}s",
                    self.timeout.as_secs()
                ))),
                None,
            ),
        };

        let Some(cause) = cause else {
            info!(snapshot_id = %snapshot.id, "execution succeeded");
            return Ok(finish(ExecutionOutcome::Succeeded, Some(snapshot.id), output));
        };

        warn!(error = %cause, snapshot_id = %snapshot.id, "execution failed; rolling back");
        let outcome = match self
            .rollback
            .rollback(request.task_id, &snapshot.id, &cause.to_string())
        {
            Ok(_) => ExecutionOutcome::RolledBack { cause },
            Err(failure) => {
                let since = Utc::now();
                let entries = snapshot
                    .covered()
                    .into_iter()
                    .map(|resource| QuarantineEntry {
                        resource,
                        task_id: request.task_id.to_string(),
                        snapshot_id: snapshot.id.clone(),
                        reason: failure.to_string(),
                        since,
                    })
                    .collect();
                let quarantined = match self.quarantine.add(entries) {
                    Ok(()) => true,
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "failed to record quarantine; halting");
                        let reason = format!(
                            "task {}: rollback of snapshot {} failed and quarantine could not be recorded",
                            request.task_id, snapshot.id
                        );
                        if let Err(err) = self.kill_switch.trip(&reason) {
                            error!(error = %format!("{err:#}"), "failed to trip kill-switch");
                        }
                        false
                    }
                };
                ExecutionOutcome::RollbackFailed {
                    cause,
                    failure,
                    quarantined,
                }
            }
        };
        Ok(finish(outcome, Some(snapshot.id), output))
    }
}
