//! Error taxonomy for the admission pipeline.
//!
//! Infrastructure failures travel as [`anyhow::Error`] with context. The
//! variants here classify failures whose handling differs: which ones keep a
//! task local and recoverable, which trigger a rollback, and which halt
//! autonomous execution.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Sandbox score stayed below the profile threshold. Drives the fix loop.
    #[error("sandbox validation failed: score {score} below threshold {threshold}")]
    Validation { score: u8, threshold: u8 },

    /// Target state diverged from expectation. Raised before any mutation.
    #[error("pre-flight check failed: {0}")]
    Preflight(String),

    /// Another execution holds the lock for this resource. Raised before any mutation.
    #[error("pre-flight check failed: resource '{0}' has an execution in flight")]
    ResourceBusy(String),

    /// The operation failed or timed out mid-flight. Triggers one rollback.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The operation completed but post-conditions were not met. Triggers rollback.
    #[error("post-flight check failed: {0}")]
    Postflight(String),

    /// Restore did not verify. Fatal for the task and its resources.
    #[error("rollback failed: {0}")]
    RollbackFailure(String),

    /// Profile or limits are unusable. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Kill-switch observed immediately before commit.
    #[error("kill-switch engaged; commit not started")]
    Cancelled,
}

impl PipelineError {
    /// Whether the failure left live state untouched and the task may simply
    /// be retried in a later cycle.
    pub fn is_deferrable(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ResourceBusy(_))
    }
}
