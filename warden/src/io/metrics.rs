//! Per-task metrics and per-cycle summaries.
//!
//! Records are append-only and never read back to make decisions.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{DecisionOutcome, ExecutionStatus, RiskLevel, TaskStatus};
use crate::io::jsonl::JsonlWriter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub cycle_id: String,
    pub task_id: String,
    pub task_type: String,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub decision: Option<DecisionOutcome>,
    pub sandbox_iterations: u32,
    pub sandbox_score: Option<u8>,
    pub execution_outcome: Option<ExecutionStatus>,
    pub final_status: TaskStatus,
    pub snapshot_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_id: String,
    pub halted: bool,
    pub dry_run: bool,
    pub discovered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub escalated: usize,
    pub blocked: usize,
    pub rolled_back: usize,
    pub rollback_failed: usize,
    pub deferred: usize,
    pub snapshots_collected: usize,
    /// Tasks whose final status could not be written back, even on retry.
    /// They stay pending and are picked up again next cycle.
    #[serde(default)]
    pub write_back_failures: usize,
    pub duration_ms: u64,
}

impl CycleSummary {
    pub fn count(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Escalated => self.escalated += 1,
            TaskStatus::Blocked => self.blocked += 1,
            TaskStatus::RolledBack => self.rolled_back += 1,
            TaskStatus::RollbackFailed => self.rollback_failed += 1,
            TaskStatus::Failed => self.failed += 1,
            // Anything short of terminal is retried next cycle.
            _ => self.deferred += 1,
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn record_task(&self, record: &MetricsRecord) -> Result<()>;
    fn record_cycle(&self, summary: &CycleSummary) -> Result<()>;
}

#[derive(Debug)]
pub struct JsonlMetricsSink {
    tasks: JsonlWriter,
    cycles: JsonlWriter,
}

impl JsonlMetricsSink {
    pub fn new(tasks: JsonlWriter, cycles: JsonlWriter) -> Self {
        Self { tasks, cycles }
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn record_task(&self, record: &MetricsRecord) -> Result<()> {
        self.tasks.append(record)
    }

    fn record_cycle(&self, summary: &CycleSummary) -> Result<()> {
        self.cycles.append(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::jsonl::read_jsonl;

    #[test]
    fn summary_counts_by_status() {
        let mut summary = CycleSummary::default();
        for status in [
            TaskStatus::Succeeded,
            TaskStatus::Succeeded,
            TaskStatus::Blocked,
            TaskStatus::Pending,
            TaskStatus::RollbackFailed,
        ] {
            summary.count(status);
        }
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.rollback_failed, 1);
    }

    #[test]
    fn sink_appends_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = JsonlMetricsSink::new(
            JsonlWriter::new(temp.path().join("metrics.jsonl")),
            JsonlWriter::new(temp.path().join("cycles.jsonl")),
        );
        let now = Utc::now();
        let record = MetricsRecord {
            cycle_id: "c".into(),
            task_id: "t".into(),
            task_type: "db_query".into(),
            risk_score: 0,
            risk_level: RiskLevel::Low,
            decision: Some(DecisionOutcome::AutoExecute),
            sandbox_iterations: 1,
            sandbox_score: Some(100),
            execution_outcome: Some(ExecutionStatus::Succeeded),
            final_status: TaskStatus::Succeeded,
            snapshot_id: None,
            started_at: now,
            ended_at: now,
        };
        sink.record_task(&record).expect("task");
        sink.record_cycle(&CycleSummary::default()).expect("cycle");

        let tasks: Vec<MetricsRecord> =
            read_jsonl(&temp.path().join("metrics.jsonl")).expect("read");
        assert_eq!(tasks, vec![record]);
        let cycles: Vec<CycleSummary> =
            read_jsonl(&temp.path().join("cycles.jsonl")).expect("read");
        assert_eq!(cycles.len(), 1);
    }
}
