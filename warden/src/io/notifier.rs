//! Human notification channel.

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::core::types::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub task_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub rationale: String,
    pub target: Option<String>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Emits notifications as `warn` events on the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        warn!(
            task_id = %notification.task_id,
            task_type = %notification.task_type,
            status = %notification.status,
            target = notification.target.as_deref().unwrap_or("-"),
            "needs attention: {}",
            notification.rationale
        );
        Ok(())
    }
}
