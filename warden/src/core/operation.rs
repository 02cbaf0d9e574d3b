//! Maps a task onto the concrete operation it performs against the state store.
//!
//! A plan names the resources the operation may touch, the post-conditions
//! that must hold afterwards, and the time budget used by the score
//! calculator. Planning is pure; applying a plan lives in `io::operator`.

use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::fingerprint::content_digest;
use crate::core::types::{canonical_task_type, resource_from_payload};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PlanError(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Read {
        resource: String,
        #[serde(default)]
        fields: Vec<String>,
    },
    Write {
        resource: String,
        content: String,
    },
    Merge {
        resource: String,
        fields: Map<String, Value>,
    },
    Delete {
        resource: String,
    },
}

impl Operation {
    pub fn resource(&self) -> &str {
        match self {
            Self::Read { resource, .. }
            | Self::Write { resource, .. }
            | Self::Merge { resource, .. }
            | Self::Delete { resource } => resource,
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Read { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostCondition {
    Exists { resource: String },
    Absent { resource: String },
    ContentDigest { resource: String, digest: String },
    FieldsEqual { resource: String, fields: Map<String, Value> },
}

impl PostCondition {
    pub fn resource(&self) -> &str {
        match self {
            Self::Exists { resource }
            | Self::Absent { resource }
            | Self::ContentDigest { resource, .. }
            | Self::FieldsEqual { resource, .. } => resource,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Exists { resource } => format!("{resource} exists"),
            Self::Absent { resource } => format!("{resource} is absent"),
            Self::ContentDigest { resource, digest } => {
                format!("{resource} has digest {}", &digest[..digest.len().min(12)])
            }
            Self::FieldsEqual { resource, fields } => {
                let names: Vec<&str> = fields.keys().map(String::as_str).collect();
                format!("{resource} fields [{}] updated", names.join(", "))
            }
        }
    }

    /// Check the condition against the resource's current content.
    pub fn evaluate(&self, current: Option<&[u8]>) -> bool {
        match self {
            Self::Exists { .. } => current.is_some(),
            Self::Absent { .. } => current.is_none(),
            Self::ContentDigest { digest, .. } => {
                current.is_some_and(|bytes| content_digest(bytes) == *digest)
            }
            Self::FieldsEqual { fields, .. } => {
                let Some(bytes) = current else {
                    return false;
                };
                let Ok(Value::Object(doc)) = serde_json::from_slice::<Value>(bytes) else {
                    return false;
                };
                fields.iter().all(|(key, value)| doc.get(key) == Some(value))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPlan {
    pub operation: Operation,
    /// Resources the operation is allowed to touch (snapshot coverage).
    pub resources: Vec<String>,
    /// Resources that must already exist before the operation runs.
    pub requires_existing: Vec<String>,
    pub post_conditions: Vec<PostCondition>,
    #[serde(with = "duration_ms")]
    pub time_budget: Duration,
}

impl OperationPlan {
    pub fn mutating(&self) -> bool {
        self.operation.is_mutating()
    }
}

pub fn time_budget(task_type: &str) -> Duration {
    let millis = match task_type {
        "db_query" => 1_000,
        "db_update" => 2_000,
        "file_read" => 500,
        "file_write" => 1_000,
        "execute_script" => 10_000,
        "system_optimization" => 30_000,
        _ => 5_000,
    };
    Duration::from_millis(millis)
}

fn required_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, PlanError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| PlanError(format!("missing payload field '{key}'")))
}

/// Normal form of a resource path: plain components joined with `/`, with
/// `.` segments and repeated separators dropped. `None` when the path is
/// empty or leaves the workdir.
pub fn canonical_resource(raw: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn checked_resource(payload: &Value) -> Result<String, PlanError> {
    let resource = resource_from_payload(payload)
        .ok_or_else(|| PlanError("missing payload field 'resource'".to_string()))?;
    canonical_resource(&resource)
        .ok_or_else(|| PlanError(format!("path escapes workdir: {resource}")))
}

/// Build the plan for a task. Only state-store operations are executable;
/// every other type is rejected.
pub fn plan(task_type: &str, payload: &Value) -> Result<OperationPlan, PlanError> {
    let task_type = canonical_task_type(task_type);
    let operation = match task_type.as_str() {
        "db_query" | "file_read" => {
            let fields = payload
                .get("fields")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Operation::Read {
                resource: checked_resource(payload)?,
                fields,
            }
        }
        "file_write" | "db_write" => Operation::Write {
            resource: checked_resource(payload)?,
            content: required_str(payload, "content")?.to_string(),
        },
        "db_update" => {
            let resource = checked_resource(payload)?;
            let fields = payload
                .get("updates")
                .and_then(Value::as_object)
                .filter(|updates| !updates.is_empty())
                .cloned()
                .ok_or_else(|| {
                    PlanError("db_update requires a non-empty 'updates' object".to_string())
                })?;
            Operation::Merge { resource, fields }
        }
        "file_delete" | "db_delete" => Operation::Delete {
            resource: checked_resource(payload)?,
        },
        other => {
            return Err(PlanError(format!(
                "unsupported task type for autonomous execution: {other}"
            )));
        }
    };

    let resource = operation.resource().to_string();
    let (requires_existing, post_conditions) = match &operation {
        Operation::Read { .. } => (
            vec![resource.clone()],
            vec![PostCondition::Exists {
                resource: resource.clone(),
            }],
        ),
        Operation::Write { content, .. } => (
            Vec::new(),
            vec![PostCondition::ContentDigest {
                resource: resource.clone(),
                digest: content_digest(content.as_bytes()),
            }],
        ),
        Operation::Merge { fields, .. } => (
            vec![resource.clone()],
            vec![PostCondition::FieldsEqual {
                resource: resource.clone(),
                fields: fields.clone(),
            }],
        ),
        Operation::Delete { .. } => (
            vec![resource.clone()],
            vec![PostCondition::Absent {
                resource: resource.clone(),
            }],
        ),
    };

    Ok(OperationPlan {
        operation,
        resources: vec![resource],
        requires_existing,
        post_conditions,
        time_budget: time_budget(&task_type),
    })
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
