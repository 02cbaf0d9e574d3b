//! Warden configuration stored under `.warden/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::retention::RetentionPolicy;
use crate::core::router::Profile;
use crate::error::PipelineError;

/// Warden configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below; a missing file yields the full default configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WardenConfig {
    /// Name of the active entry in `profiles`.
    pub profile: String,

    /// Upper bound on tasks processed per cycle (and concurrently).
    pub max_concurrent_tasks: usize,

    /// Sandbox attempts per task, including the first.
    pub max_sandbox_iterations: u32,

    /// Hard wall-clock limit on a production operation.
    pub execution_timeout_secs: u64,

    /// Wall-clock limit on a single sandbox attempt.
    pub sandbox_attempt_timeout_secs: u64,

    /// Live state root, relative to the project root unless absolute.
    pub workspace_dir: PathBuf,

    /// Sentinel file; its presence halts autonomous execution.
    pub kill_switch_path: PathBuf,

    pub retention: RetentionPolicy,

    pub profiles: BTreeMap<String, Profile>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("autonomous".to_string(), Profile::autonomous());
        profiles.insert("supervised".to_string(), Profile::supervised());
        Self {
            profile: "autonomous".to_string(),
            max_concurrent_tasks: 3,
            max_sandbox_iterations: 5,
            execution_timeout_secs: 600,
            sandbox_attempt_timeout_secs: 60,
            workspace_dir: PathBuf::from("workspace"),
            kill_switch_path: PathBuf::from(".warden/KILL_SWITCH"),
            retention: RetentionPolicy::default(),
            profiles,
        }
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    PipelineError::Configuration(message.into()).into()
}

impl WardenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(invalid("max_concurrent_tasks must be > 0"));
        }
        if self.max_sandbox_iterations == 0 {
            return Err(invalid("max_sandbox_iterations must be > 0"));
        }
        if self.execution_timeout_secs == 0 {
            return Err(invalid("execution_timeout_secs must be > 0"));
        }
        if self.sandbox_attempt_timeout_secs == 0 {
            return Err(invalid("sandbox_attempt_timeout_secs must be > 0"));
        }
        if !self.profiles.contains_key(&self.profile) {
            return Err(invalid(format!(
                "active profile '{}' is not defined under [profiles]",
                self.profile
            )));
        }
        for (name, profile) in &self.profiles {
            profile.validate(name)?;
        }
        Ok(())
    }

    pub fn active_profile(&self) -> Result<&Profile> {
        self.profiles
            .get(&self.profile)
            .ok_or_else(|| invalid(format!("unknown profile '{}'", self.profile)))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn sandbox_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_attempt_timeout_secs)
    }

    pub fn workspace_path(&self, root: &Path) -> PathBuf {
        root.join(&self.workspace_dir)
    }

    pub fn kill_switch_path(&self, root: &Path) -> PathBuf {
        root.join(&self.kill_switch_path)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WardenConfig::default()`.
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    if !path.exists() {
        let cfg = WardenConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WardenConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WardenConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, buf.as_bytes())
}
