//! Resources locked out of autonomous execution after a failed rollback.
//!
//! Entries persist in `.warden/state/quarantine.json` until a human clears
//! them with `warden quarantine clear`.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::operation::canonical_resource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub resource: String,
    pub task_id: String,
    pub snapshot_id: String,
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Key resources compare under, so `./a.txt` and `a.txt` name one entry.
fn resource_key(resource: &str) -> String {
    canonical_resource(resource).unwrap_or_else(|| resource.to_string())
}

#[derive(Debug)]
pub struct Quarantine {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Quarantine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("quarantine lock poisoned"))
    }

    fn read(&self) -> Result<Vec<QuarantineEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", self.path.display()))
    }

    fn write(&self, entries: &[QuarantineEntry]) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(entries)?;
        buf.push('\n');
        super::write_atomic(&self.path, buf.as_bytes())
    }

    pub fn entries(&self) -> Result<Vec<QuarantineEntry>> {
        let _guard = self.guard()?;
        self.read()
    }

    pub fn find(&self, resource: &str) -> Result<Option<QuarantineEntry>> {
        let key = resource_key(resource);
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| resource_key(&e.resource) == key))
    }

    /// Quarantine resources. A resource already quarantined keeps its
    /// original entry.
    pub fn add(&self, new_entries: Vec<QuarantineEntry>) -> Result<()> {
        let _guard = self.guard()?;
        let mut entries = self.read()?;
        for entry in new_entries {
            let key = resource_key(&entry.resource);
            if !entries.iter().any(|e| resource_key(&e.resource) == key) {
                entries.push(entry);
            }
        }
        self.write(&entries)
    }

    /// Returns whether the resource was quarantined.
    pub fn clear(&self, resource: &str) -> Result<bool> {
        let _guard = self.guard()?;
        let mut entries = self.read()?;
        let key = resource_key(resource);
        let before = entries.len();
        entries.retain(|e| resource_key(&e.resource) != key);
        if entries.len() == before {
            return Ok(false);
        }
        self.write(&entries)?;
        Ok(true)
    }

    /// Snapshots that garbage collection must keep.
    pub fn pinned_snapshots(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|e| e.snapshot_id)
            .collect())
    }
}
