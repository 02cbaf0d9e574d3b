//! Restore live state from a snapshot and prove the restore was exact.
//!
//! Every attempt, successful or not, is appended to the rollback log.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::core::fingerprint::{drifted, fingerprint};
use crate::error::PipelineError;
use crate::io::jsonl::JsonlWriter;
use crate::io::snapshot::{Snapshot, SnapshotStore};
use crate::io::state_store::{StateStore, digests};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub timestamp: DateTime<Utc>,
    pub snapshot_id: String,
    pub task_id: String,
    pub reason: String,
    pub success: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub snapshot_id: String,
    pub restored: Vec<String>,
    pub fingerprint: String,
}

/// Live state compared against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub snapshot_id: String,
    pub task_id: String,
    pub matches: bool,
    pub drifted: Vec<String>,
    pub corrupt_blobs: Vec<String>,
}

pub struct RollbackManager {
    live: Arc<dyn StateStore>,
    snapshots: Arc<SnapshotStore>,
    log: Arc<JsonlWriter>,
}

impl RollbackManager {
    pub fn new(
        live: Arc<dyn StateStore>,
        snapshots: Arc<SnapshotStore>,
        log: Arc<JsonlWriter>,
    ) -> Self {
        Self {
            live,
            snapshots,
            log,
        }
    }

    /// Restore `snapshot_id` on behalf of `task_id`.
    ///
    /// Refuses snapshots that belong to another task. Any failure, including
    /// a restored fingerprint that does not match, is a
    /// [`PipelineError::RollbackFailure`].
    #[instrument(skip_all, fields(task_id = %task_id, snapshot_id = %snapshot_id))]
    pub fn rollback(
        &self,
        task_id: &str,
        snapshot_id: &str,
        reason: &str,
    ) -> Result<RollbackReport, PipelineError> {
        let outcome = self.restore(task_id, snapshot_id);
        let (success, detail) = match &outcome {
            Ok(report) => (
                true,
                format!("restored {} resource(s)", report.restored.len()),
            ),
            Err(err) => (false, err.to_string()),
        };
        let event = RollbackEvent {
            timestamp: Utc::now(),
            snapshot_id: snapshot_id.to_string(),
            task_id: task_id.to_string(),
            reason: reason.to_string(),
            success,
            detail,
        };
        if let Err(err) = self.log.append(&event) {
            error!(error = %format!("{err:#}"), "failed to append rollback log");
        }
        match &outcome {
            Ok(_) => info!(reason, "rollback verified"),
            Err(err) => error!(reason, error = %err, "rollback failed"),
        }
        outcome
    }

    fn restore(&self, task_id: &str, snapshot_id: &str) -> Result<RollbackReport, PipelineError> {
        let fail = PipelineError::RollbackFailure;
        let snapshot = self
            .snapshots
            .load(snapshot_id)
            .map_err(|err| fail(format!("{err:#}")))?;
        if snapshot.task_id != task_id {
            return Err(fail(format!(
                "snapshot {snapshot_id} belongs to task {}, not {task_id}",
                snapshot.task_id
            )));
        }

        let mut restored = Vec::new();
        for captured in &snapshot.resources {
            let step = match &captured.digest {
                Some(digest) => self
                    .snapshots
                    .blob(snapshot_id, digest)
                    .and_then(|bytes| self.live.write(&captured.resource, &bytes)),
                None => self.live.remove(&captured.resource),
            };
            step.map_err(|err| fail(format!("restore {}: {err:#}", captured.resource)))?;
            restored.push(captured.resource.clone());
        }

        let current = digests(self.live.as_ref(), &snapshot.covered())
            .map_err(|err| fail(format!("re-read restored state: {err:#}")))?;
        let actual = fingerprint(&current);
        if actual != snapshot.fingerprint {
            let diverged = drifted(&snapshot.digest_map(), &current);
            return Err(fail(format!(
                "restored fingerprint {} does not match snapshot {} (drifted: {})",
                short(&actual),
                short(&snapshot.fingerprint),
                diverged.join(", ")
            )));
        }

        Ok(RollbackReport {
            snapshot_id: snapshot_id.to_string(),
            restored,
            fingerprint: actual,
        })
    }

    /// Compare live state to a snapshot without changing anything.
    pub fn verify(&self, snapshot_id: &str) -> Result<VerifyReport> {
        let snapshot = self.snapshots.load(snapshot_id)?;
        self.verify_snapshot(&snapshot)
    }

    pub fn verify_snapshot(&self, snapshot: &Snapshot) -> Result<VerifyReport> {
        let current = digests(self.live.as_ref(), &snapshot.covered())?;
        let drifted = drifted(&snapshot.digest_map(), &current);
        let corrupt_blobs = self.snapshots.corrupt_blobs(snapshot);
        Ok(VerifyReport {
            snapshot_id: snapshot.id.clone(),
            task_id: snapshot.task_id.clone(),
            matches: drifted.is_empty() && corrupt_blobs.is_empty(),
            drifted,
            corrupt_blobs,
        })
    }
}

fn short(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::jsonl::read_jsonl;
    use crate::io::state_store::MemoryStateStore;
    use crate::test_support::FreezableStore;

    struct Fixture {
        temp: tempfile::TempDir,
        live: Arc<FreezableStore>,
        snapshots: Arc<SnapshotStore>,
        manager: RollbackManager,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let live = Arc::new(FreezableStore::new(MemoryStateStore::from_entries([(
            "a.txt", "original",
        )])));
        let snapshots = Arc::new(SnapshotStore::new(temp.path().join("snapshots")));
        let manager = RollbackManager::new(
            live.clone(),
            snapshots.clone(),
            Arc::new(JsonlWriter::new(temp.path().join("rollbacks.jsonl"))),
        );
        Fixture {
            temp,
            live,
            snapshots,
            manager,
        }
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn restores_content_and_removes_created_resources() {
        let f = fixture();
        let snapshot = f
            .snapshots
            .capture("t", &names(&["a.txt", "new.txt"]), f.live.as_ref())
            .expect("capture");
        f.live.write("a.txt", b"changed").expect("write");
        f.live.write("new.txt", b"created").expect("write");

        let report = f.manager.rollback("t", &snapshot.id, "test").expect("rollback");
        assert_eq!(report.fingerprint, snapshot.fingerprint);
        assert_eq!(f.live.read("a.txt").expect("read"), Some(b"original".to_vec()));
        assert_eq!(f.live.read("new.txt").expect("read"), None);

        let events: Vec<RollbackEvent> =
            read_jsonl(&f.temp.path().join("rollbacks.jsonl")).expect("log");
        assert_eq!(events.len(), 1);
        assert!(events[0].success);
    }

    #[test]
    fn refuses_snapshot_of_another_task() {
        let f = fixture();
        let snapshot = f
            .snapshots
            .capture("owner", &names(&["a.txt"]), f.live.as_ref())
            .expect("capture");
        let err = f
            .manager
            .rollback("intruder", &snapshot.id, "test")
            .expect_err("foreign snapshot");
        assert!(matches!(err, PipelineError::RollbackFailure(msg) if msg.contains("belongs to task owner")));
    }

    #[test]
    fn unverifiable_restore_is_a_rollback_failure() {
        let f = fixture();
        let snapshot = f
            .snapshots
            .capture("t", &names(&["a.txt"]), f.live.as_ref())
            .expect("capture");
        f.live.write("a.txt", b"changed").expect("write");
        f.live.freeze();

        let err = f.manager.rollback("t", &snapshot.id, "test").expect_err("frozen");
        assert!(err.to_string().contains("does not match snapshot"));
        let events: Vec<RollbackEvent> =
            read_jsonl(&f.temp.path().join("rollbacks.jsonl")).expect("log");
        assert!(!events[0].success);
    }

    #[test]
    fn verify_reports_drift() {
        let f = fixture();
        let snapshot = f
            .snapshots
            .capture("t", &names(&["a.txt"]), f.live.as_ref())
            .expect("capture");
        assert!(f.manager.verify(&snapshot.id).expect("verify").matches);
        f.live.write("a.txt", b"drift").expect("write");
        let report = f.manager.verify(&snapshot.id).expect("verify");
        assert!(!report.matches);
        assert_eq!(report.drifted, names(&["a.txt"]));
    }
}
