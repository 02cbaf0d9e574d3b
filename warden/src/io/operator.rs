//! The real operation behind an [`OperationPlan`](crate::core::operation::OperationPlan).
//!
//! The same [`Operator`] runs against the sandbox copy and against live state,
//! so a sandbox pass exercises exactly the code that will commit.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::operation::Operation;
use crate::io::state_store::StateStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationOutput {
    Read { content: Value },
    Written { bytes: usize },
    Merged { fields: usize },
    Deleted,
}

#[async_trait]
pub trait Operator: Send + Sync {
    async fn apply(&self, operation: &Operation, store: &dyn StateStore)
    -> Result<OperationOutput>;
}

/// Applies read/write/merge/delete directly to a [`StateStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StateOperator;

fn load_existing(store: &dyn StateStore, resource: &str) -> Result<Vec<u8>> {
    store
        .read(resource)?
        .ok_or_else(|| anyhow!("resource not found: {resource}"))
}

fn parse_object(bytes: &[u8], resource: &str) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes)
        .with_context(|| format!("parse {resource} as JSON"))?
    {
        Value::Object(map) => Ok(map),
        _ => bail!("resource is not a JSON object: {resource}"),
    }
}

#[async_trait]
impl Operator for StateOperator {
    async fn apply(
        &self,
        operation: &Operation,
        store: &dyn StateStore,
    ) -> Result<OperationOutput> {
        debug!(resource = operation.resource(), "applying operation");
        match operation {
            Operation::Read { resource, fields } => {
                let bytes = load_existing(store, resource)?;
                if fields.is_empty() {
                    let content = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                        Value::String(String::from_utf8_lossy(&bytes).into_owned())
                    });
                    return Ok(OperationOutput::Read { content });
                }
                let doc = parse_object(&bytes, resource)?;
                let mut projected = Map::new();
                for field in fields {
                    let value = doc
                        .get(field)
                        .ok_or_else(|| anyhow!("no such field: {field}"))?;
                    projected.insert(field.clone(), value.clone());
                }
                Ok(OperationOutput::Read {
                    content: Value::Object(projected),
                })
            }
            Operation::Write { resource, content } => {
                store.write(resource, content.as_bytes())?;
                Ok(OperationOutput::Written {
                    bytes: content.len(),
                })
            }
            Operation::Merge { resource, fields } => {
                let bytes = load_existing(store, resource)?;
                let mut doc = parse_object(&bytes, resource)?;
                for (key, value) in fields {
                    doc.insert(key.clone(), value.clone());
                }
                let mut buf = serde_json::to_vec_pretty(&Value::Object(doc))?;
                buf.push(b'\n');
                store.write(resource, &buf)?;
                Ok(OperationOutput::Merged {
                    fields: fields.len(),
                })
            }
            Operation::Delete { resource } => {
                load_existing(store, resource)?;
                store.remove(resource)?;
                Ok(OperationOutput::Deleted)
            }
        }
    }
}
