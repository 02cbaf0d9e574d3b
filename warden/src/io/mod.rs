//! I/O adapters for warden commands.

pub mod config;
pub mod jsonl;
pub mod kill_switch;
pub mod locks;
pub mod metrics;
pub mod notifier;
pub mod operator;
pub mod paths;
pub mod quarantine;
pub mod snapshot;
pub mod state_store;
pub mod task_source;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Write `contents` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
