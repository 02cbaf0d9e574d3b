//! Canonical `.warden/` layout and `warden init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{WardenConfig, write_config};

/// All canonical paths within `.warden/` for a project root.
#[derive(Debug, Clone)]
pub struct WardenPaths {
    pub root: PathBuf,
    pub warden_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub config_path: PathBuf,
    pub tasks_path: PathBuf,
    pub quarantine_path: PathBuf,
    pub metrics_path: PathBuf,
    pub cycles_path: PathBuf,
    pub rollbacks_path: PathBuf,
}

impl WardenPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let warden_dir = root.join(".warden");
        let state_dir = warden_dir.join("state");
        let logs_dir = warden_dir.join("logs");
        Self {
            root: root.clone(),
            warden_dir: warden_dir.clone(),
            state_dir: state_dir.clone(),
            logs_dir: logs_dir.clone(),
            snapshots_dir: warden_dir.join("snapshots"),
            config_path: warden_dir.join("config.toml"),
            tasks_path: state_dir.join("tasks.json"),
            quarantine_path: state_dir.join("quarantine.json"),
            metrics_path: logs_dir.join("metrics.jsonl"),
            cycles_path: logs_dir.join("cycles.jsonl"),
            rollbacks_path: logs_dir.join("rollbacks.jsonl"),
        }
    }
}

/// Options for `init_warden`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing warden-owned files.
    pub force: bool,
}

/// Create `.warden/` scaffolding in `root`.
///
/// Fails if `.warden/` already exists unless `options.force` is set. Live
/// state under the workspace directory is never touched beyond creating it.
pub fn init_warden(root: &Path, options: &InitOptions) -> Result<WardenPaths> {
    let paths = WardenPaths::new(root);
    if paths.warden_dir.exists() && !options.force {
        return Err(anyhow!(
            "warden init: .warden already exists (use --force to overwrite)"
        ));
    }
    if paths.warden_dir.exists() && !paths.warden_dir.is_dir() {
        return Err(anyhow!("warden init: .warden exists but is not a directory"));
    }

    let config = WardenConfig::default();
    for dir in [
        &paths.warden_dir,
        &paths.state_dir,
        &paths.logs_dir,
        &paths.snapshots_dir,
        &config.workspace_path(root),
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    write_config(&paths.config_path, &config)?;
    super::write_atomic(&paths.tasks_path, b"[]\n")?;
    super::write_atomic(&paths.quarantine_path, b"[]\n")?;

    Ok(paths)
}
