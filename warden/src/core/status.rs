//! Task lifecycle state machine.
//!
//! Transitions are monotonic: no gate may be skipped and terminal states are
//! final.

use thiserror::Error;

use crate::core::types::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::{
        Approved, Blocked, Escalated, Executing, Failed, Pending, RollbackFailed, RolledBack,
        Routing, Sandboxed, Scoring, Succeeded,
    };
    matches!(
        (from, to),
        (Pending, Scoring)
            | (Scoring, Routing | Failed)
            | (Routing, Blocked | Escalated | Sandboxed | Failed)
            | (Sandboxed, Approved | Escalated | Failed)
            | (Approved, Executing | Pending | Escalated | Failed)
            | (Executing, Succeeded | RolledBack | RollbackFailed | Failed)
    )
}

/// Status of one task as it moves through a cycle, with the path taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    trail: Vec<TaskStatus>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            trail: vec![TaskStatus::Pending],
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.trail
            .last()
            .copied()
            .unwrap_or(TaskStatus::Pending)
    }

    pub fn trail(&self) -> &[TaskStatus] {
        &self.trail
    }

    pub fn advance(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        let from = self.status();
        if !can_transition(from, next) {
            return Err(TransitionError { from, to: next });
        }
        self.trail.push(next);
        Ok(())
    }

    /// Move to `failed` from wherever the task currently is, if permitted.
    /// Returns false when the current state has no failure edge.
    pub fn fail(&mut self) -> bool {
        self.advance(TaskStatus::Failed).is_ok()
    }
}
