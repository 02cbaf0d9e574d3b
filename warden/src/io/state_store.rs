//! Live state behind a narrow read/write/remove interface.
//!
//! Resources are relative names (`notes/a.txt`, `tables/users.json`). The
//! filesystem store maps them under the workspace directory; the memory store
//! backs sandbox trials and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};

use crate::core::fingerprint::{DigestMap, content_digest};

pub trait StateStore: Send + Sync {
    fn read(&self, resource: &str) -> Result<Option<Vec<u8>>>;
    fn write(&self, resource: &str, contents: &[u8]) -> Result<()>;
    /// Removing an absent resource is not an error.
    fn remove(&self, resource: &str) -> Result<()>;
    fn health_check(&self) -> Result<()>;
}

/// Current digest of each resource (absent resources map to `None`).
pub fn digests(store: &dyn StateStore, resources: &[String]) -> Result<DigestMap> {
    let mut out = DigestMap::new();
    for resource in resources {
        let digest = store.read(resource)?.map(|bytes| content_digest(&bytes));
        out.insert(resource.clone(), digest);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, resource: &str) -> Result<PathBuf> {
        let relative = Path::new(resource);
        let valid = !resource.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            bail!("path escapes workdir: {resource}");
        }
        Ok(self.root.join(relative))
    }
}

impl StateStore for FsStateStore {
    fn read(&self, resource: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(resource)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    fn write(&self, resource: &str, contents: &[u8]) -> Result<()> {
        let path = self.resolve(resource)?;
        super::write_atomic(&path, contents)
    }

    fn remove(&self, resource: &str) -> Result<()> {
        let path = self.resolve(resource)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }

    fn health_check(&self) -> Result<()> {
        if !self.root.is_dir() {
            bail!("workspace {} is not a directory", self.root.display());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("memory state store lock poisoned"))
    }

    pub fn contents(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(self.lock()?.clone())
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self, resource: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(resource).cloned())
    }

    fn write(&self, resource: &str, contents: &[u8]) -> Result<()> {
        self.lock()?.insert(resource.to_string(), contents.to_vec());
        Ok(())
    }

    fn remove(&self, resource: &str) -> Result<()> {
        self.lock()?.remove(resource);
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

/// Wraps a store and records every resource touched through it.
pub struct RecordingStore<'a> {
    inner: &'a dyn StateStore,
    touched: Mutex<BTreeSet<String>>,
}

impl<'a> RecordingStore<'a> {
    pub fn new(inner: &'a dyn StateStore) -> Self {
        Self {
            inner,
            touched: Mutex::new(BTreeSet::new()),
        }
    }

    fn note(&self, resource: &str) -> Result<()> {
        self.touched
            .lock()
            .map_err(|_| anyhow!("recording store lock poisoned"))?
            .insert(resource.to_string());
        Ok(())
    }

    pub fn touched(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .touched
            .lock()
            .map_err(|_| anyhow!("recording store lock poisoned"))?
            .clone())
    }
}

impl StateStore for RecordingStore<'_> {
    fn read(&self, resource: &str) -> Result<Option<Vec<u8>>> {
        self.note(resource)?;
        self.inner.read(resource)
    }

    fn write(&self, resource: &str, contents: &[u8]) -> Result<()> {
        self.note(resource)?;
        self.inner.write(resource, contents)
    }

    fn remove(&self, resource: &str) -> Result<()> {
        self.note(resource)?;
        self.inner.remove(resource)
    }

    fn health_check(&self) -> Result<()> {
        self.inner.health_check()
    }
}
