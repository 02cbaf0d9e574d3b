//! Shared deterministic types for the admission pipeline.
//!
//! These types define stable contracts between pipeline stages and the task
//! store. Serialized forms are part of the on-disk format.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::score::ScoreBreakdown;

/// Lifecycle status of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scoring,
    Routing,
    Sandboxed,
    Approved,
    Executing,
    Succeeded,
    Failed,
    RolledBack,
    Blocked,
    Escalated,
    RollbackFailed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scoring => "scoring",
            Self::Routing => "routing",
            Self::Sandboxed => "sandboxed",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Blocked => "blocked",
            Self::Escalated => "escalated",
            Self::RollbackFailed => "rollback_failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed
                | Self::RolledBack
                | Self::Blocked
                | Self::Escalated
                | Self::RollbackFailed
        )
    }

    /// Terminal states a human should hear about.
    pub fn needs_attention(self) -> bool {
        matches!(
            self,
            Self::Escalated | Self::Blocked | Self::RolledBack | Self::RollbackFailed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the task table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Where a task's target resource lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Workdir,
    Shared,
    Production,
}

impl Scope {
    /// Unrecognized scope names are treated as production.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "workdir" | "local" => Self::Workdir,
            "shared" => Self::Shared,
            _ => Self::Production,
        }
    }
}

/// Risk-relevant view of a task, derived from its type and payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDescriptor {
    pub task_type: String,
    pub resource: Option<String>,
    pub scope: Scope,
    pub keywords: Vec<String>,
    pub cost: f64,
}

impl TaskDescriptor {
    pub fn from_parts(task_type: &str, payload: &Value) -> Self {
        let scope = payload
            .get("scope")
            .and_then(Value::as_str)
            .map_or(Scope::Workdir, Scope::parse);
        let keywords = payload
            .get("keywords")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_ascii_lowercase)
                    .collect()
            })
            .unwrap_or_default();
        let cost = payload.get("cost").and_then(Value::as_f64).unwrap_or(0.0);

        Self {
            task_type: canonical_task_type(task_type),
            resource: resource_from_payload(payload),
            scope,
            keywords,
            cost,
        }
    }

    pub fn from_task(task: &Task) -> Self {
        Self::from_parts(&task.task_type, &task.payload)
    }
}

/// Normalize a task type, folding the verb-first aliases onto canonical names.
pub fn canonical_task_type(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let canonical = match lowered.as_str() {
        "query_db" => "db_query",
        "update_db" => "db_update",
        "write_db" => "db_write",
        "delete_db" => "db_delete",
        "write_file" => "file_write",
        "read_file" => "file_read",
        "delete_file" => "file_delete",
        other => other,
    };
    canonical.to_string()
}

/// Target resource named by a payload.
///
/// `table` names map to `tables/<name>.json` documents in the state store.
pub fn resource_from_payload(payload: &Value) -> Option<String> {
    for key in ["resource", "path", "file_path"] {
        if let Some(value) = payload.get(key).and_then(Value::as_str) {
            return Some(value.to_string());
        }
    }
    payload
        .get("table")
        .and_then(Value::as_str)
        .map(|table| format!("tables/{table}.json"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    /// Map a 0-100 score onto its band. Scores above 100 are treated as 100.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=30 => Self::Low,
            31..=60 => Self::Medium,
            61..=85 => Self::High,
            _ => Self::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub task_id: String,
    pub score: u8,
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    AutoExecute,
    ConditionalExecute,
    EscalateHuman,
    Block,
}

impl DecisionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoExecute => "AUTO_EXECUTE",
            Self::ConditionalExecute => "CONDITIONAL_EXECUTE",
            Self::EscalateHuman => "ESCALATE_HUMAN",
            Self::Block => "BLOCK",
        }
    }

    /// Whether the outcome clears the task for (sandboxed) execution.
    pub fn executes(self) -> bool {
        matches!(self, Self::AutoExecute | Self::ConditionalExecute)
    }
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub task_id: String,
    pub outcome: DecisionOutcome,
    pub rationale: String,
    pub requires_sandbox: bool,
    pub sandbox_threshold: Option<u8>,
    pub escalation_target: Option<String>,
}

/// The version of a task currently under sandbox trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub iteration: u32,
    pub task_type: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_note: Option<String>,
}

impl Candidate {
    pub fn from_task(task: &Task) -> Self {
        Self {
            iteration: 1,
            task_type: canonical_task_type(&task.task_type),
            payload: task.payload.clone(),
            fix_note: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxAttempt {
    pub task_id: String,
    pub iteration: u32,
    pub score: u8,
    pub passed: bool,
    pub errors: Vec<String>,
    pub checks: ScoreBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Simulated,
    Aborted,
    RolledBack,
    RollbackFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: String,
    pub snapshot_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: ExecutionStatus,
    pub rollback_triggered: bool,
}
