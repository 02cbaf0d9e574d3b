//! Immutable, content-addressed snapshots of resource state.
//!
//! Layout under `.warden/snapshots/`:
//!
//! ```text
//! <id>/snapshot.json      metadata (task, resources, digests, fingerprint)
//! <id>/blobs/<sha256>     captured contents, named by digest
//! ```
//!
//! A snapshot is assembled in a `.tmp-<id>` directory and renamed into place,
//! so a visible snapshot is always complete.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::fingerprint::{DigestMap, content_digest, fingerprint};
use crate::core::retention::{RetentionEntry, RetentionPolicy, select_expired};
use crate::io::state_store::StateStore;

const METADATA_FILE: &str = "snapshot.json";
const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResource {
    pub resource: String,
    /// `None` records that the resource did not exist at capture time.
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub resources: Vec<CapturedResource>,
    pub fingerprint: String,
}

impl Snapshot {
    pub fn digest_map(&self) -> DigestMap {
        self.resources
            .iter()
            .map(|r| (r.resource.clone(), r.digest.clone()))
            .collect()
    }

    pub fn covered(&self) -> Vec<String> {
        self.resources.iter().map(|r| r.resource.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        bail!("invalid snapshot id '{id}'");
    }
    Ok(())
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Capture the current content of `resources` for `task_id`.
    ///
    /// The snapshot is staged under `.tmp-<id>` and renamed into place; a
    /// failed capture removes the staging directory.
    pub fn capture(
        &self,
        task_id: &str,
        resources: &[String],
        state: &dyn StateStore,
    ) -> Result<Snapshot> {
        let id = Uuid::new_v4().to_string();
        let tmp_dir = self.root.join(format!(".tmp-{id}"));
        let staged = Self::stage(&tmp_dir, &id, task_id, resources, state).and_then(|snapshot| {
            let final_dir = self.dir(&id);
            fs::rename(&tmp_dir, &final_dir)
                .with_context(|| format!("publish snapshot {}", final_dir.display()))?;
            Ok(snapshot)
        });
        let snapshot = match staged {
            Ok(snapshot) => snapshot,
            Err(err) => {
                if tmp_dir.exists() {
                    if let Err(cleanup) = fs::remove_dir_all(&tmp_dir) {
                        warn!(path = %tmp_dir.display(), error = %cleanup, "failed to remove staged snapshot");
                    }
                }
                return Err(err);
            }
        };
        info!(snapshot_id = %id, task_id, resources = snapshot.resources.len(), "snapshot captured");
        Ok(snapshot)
    }

    fn stage(
        tmp_dir: &Path,
        id: &str,
        task_id: &str,
        resources: &[String],
        state: &dyn StateStore,
    ) -> Result<Snapshot> {
        let blobs_dir = tmp_dir.join(BLOBS_DIR);
        fs::create_dir_all(&blobs_dir)
            .with_context(|| format!("create directory {}", blobs_dir.display()))?;

        let unique: BTreeSet<&String> = resources.iter().collect();
        let mut captured = Vec::with_capacity(unique.len());
        for resource in unique {
            let digest = match state.read(resource)? {
                Some(bytes) => {
                    let digest = content_digest(&bytes);
                    let blob_path = blobs_dir.join(&digest);
                    if !blob_path.exists() {
                        fs::write(&blob_path, &bytes)
                            .with_context(|| format!("write blob {}", blob_path.display()))?;
                    }
                    Some(digest)
                }
                None => None,
            };
            captured.push(CapturedResource {
                resource: resource.clone(),
                digest,
            });
        }

        let mut snapshot = Snapshot {
            id: id.to_string(),
            task_id: task_id.to_string(),
            created_at: Utc::now(),
            resources: captured,
            fingerprint: String::new(),
        };
        snapshot.fingerprint = fingerprint(&snapshot.digest_map());

        let mut buf = serde_json::to_string_pretty(&snapshot)?;
        buf.push('\n');
        let meta_path = tmp_dir.join(METADATA_FILE);
        fs::write(&meta_path, buf).with_context(|| format!("write {}", meta_path.display()))?;
        Ok(snapshot)
    }

    pub fn load(&self, id: &str) -> Result<Snapshot> {
        validate_id(id)?;
        let path = self.dir(id).join(METADATA_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(anyhow!("snapshot {id} not found"));
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Stored content for `digest`, checked against the digest.
    pub fn blob(&self, id: &str, digest: &str) -> Result<Vec<u8>> {
        validate_id(id)?;
        let path = self.dir(id).join(BLOBS_DIR).join(digest);
        let bytes = fs::read(&path).with_context(|| format!("read blob {}", path.display()))?;
        let actual = content_digest(&bytes);
        if actual != digest {
            bail!("blob {} is corrupt (digest {actual})", path.display());
        }
        Ok(bytes)
    }

    /// Blobs of a snapshot that are missing or fail their digest check.
    pub fn corrupt_blobs(&self, snapshot: &Snapshot) -> Vec<String> {
        snapshot
            .resources
            .iter()
            .filter_map(|r| {
                let digest = r.digest.as_deref()?;
                self.blob(&snapshot.id, digest)
                    .is_err()
                    .then(|| r.resource.clone())
            })
            .collect()
    }

    /// All snapshots, newest first. Unreadable entries are skipped with a warning.
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in
            fs::read_dir(&self.root).with_context(|| format!("read {}", self.root.display()))?
        {
            let entry = entry.with_context(|| format!("read {}", self.root.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match self.load(&name) {
                Ok(snapshot) => out.push(snapshot),
                Err(err) => warn!(snapshot_id = %name, error = %err, "skipping unreadable snapshot"),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let dir = self.dir(id);
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))
    }

    /// Delete snapshots selected by the retention policy; returns deleted ids.
    pub fn collect_garbage(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        pinned: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let entries: Vec<RetentionEntry> = self
            .list()?
            .into_iter()
            .map(|s| RetentionEntry {
                id: s.id,
                created_at: s.created_at,
            })
            .collect();
        let expired = select_expired(&entries, now, policy, pinned);
        for id in &expired {
            self.delete(id)?;
            debug!(snapshot_id = %id, "snapshot collected");
        }
        Ok(expired)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::state_store::{FsStateStore, MemoryStateStore};

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn capture_records_present_and_absent_resources() {
        let temp = tempfile::tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(temp.path());
        let state = MemoryStateStore::from_entries([("a", "hello")]);

        let snapshot = snapshots
            .capture("task-1", &names(&["a", "missing"]), &state)
            .expect("capture");
        assert_eq!(snapshot.task_id, "task-1");
        assert_eq!(snapshot.resources.len(), 2);
        let digest = snapshot.resources[0].digest.clone().expect("present");
        assert_eq!(snapshot.resources[1].digest, None);
        assert_eq!(snapshots.blob(&snapshot.id, &digest).expect("blob"), b"hello");

        let loaded = snapshots.load(&snapshot.id).expect("load");
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.fingerprint, fingerprint(&loaded.digest_map()));
        assert!(snapshots.corrupt_blobs(&loaded).is_empty());
    }

    #[test]
    fn failed_capture_leaves_no_staging_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(temp.path().join("snapshots"));
        let state = FsStateStore::new(temp.path().join("workspace"));

        let err = snapshots
            .capture("t", &names(&["a.txt", "../outside"]), &state)
            .expect_err("unreadable resource");
        assert!(format!("{err:#}").contains("escapes"), "{err:#}");

        let leftovers: Vec<_> = fs::read_dir(temp.path().join("snapshots"))
            .expect("snapshots root")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        assert!(snapshots.list().expect("list").is_empty());
    }

    #[test]
    fn tampered_blob_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(temp.path());
        let state = MemoryStateStore::from_entries([("a", "hello")]);
        let snapshot = snapshots.capture("t", &names(&["a"]), &state).expect("capture");
        let digest = snapshot.resources[0].digest.clone().expect("present");
        fs::write(temp.path().join(&snapshot.id).join(BLOBS_DIR).join(&digest), "evil")
            .expect("tamper");
        assert!(snapshots.blob(&snapshot.id, &digest).is_err());
        assert_eq!(snapshots.corrupt_blobs(&snapshot), names(&["a"]));
    }

    #[test]
    fn list_skips_temp_dirs_and_gc_deletes_beyond_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(temp.path());
        let state = MemoryStateStore::from_entries([("a", "1")]);
        let first = snapshots.capture("t1", &names(&["a"]), &state).expect("capture");
        let second = snapshots.capture("t2", &names(&["a"]), &state).expect("capture");
        fs::create_dir_all(temp.path().join(".tmp-abandoned")).expect("tmp");

        assert_eq!(snapshots.list().expect("list").len(), 2);

        let policy = RetentionPolicy {
            max_snapshots: 0,
            max_age_days: 30,
        };
        let pinned: BTreeSet<String> = [first.id.clone()].into();
        let collected = snapshots
            .collect_garbage(&policy, Utc::now(), &pinned)
            .expect("gc");
        assert_eq!(collected, vec![second.id.clone()]);
        let remaining = snapshots.list().expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, first.id);
    }

    #[test]
    fn load_rejects_path_like_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(temp.path());
        assert!(snapshots.load("../etc").is_err());
        assert!(snapshots.load("unknown-id").is_err());
    }
}
