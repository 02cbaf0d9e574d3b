//! Kill-switch seam. Sampled at cycle start and immediately before commit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

pub trait KillSwitch: Send + Sync {
    fn engaged(&self) -> bool;

    /// Engage the switch from inside the pipeline. It stays engaged until an
    /// operator releases it.
    fn trip(&self, reason: &str) -> Result<()>;
}

/// Engaged while the sentinel file exists.
#[derive(Debug, Clone)]
pub struct SentinelKillSwitch {
    path: PathBuf,
}

impl SentinelKillSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KillSwitch for SentinelKillSwitch {
    fn engaged(&self) -> bool {
        self.path.exists()
    }

    fn trip(&self, reason: &str) -> Result<()> {
        super::write_atomic(&self.path, format!("{reason}\n").as_bytes())
    }
}

/// In-process switch, flipped programmatically.
#[derive(Debug, Default)]
pub struct FlagKillSwitch {
    flag: AtomicBool,
}

impl FlagKillSwitch {
    pub fn engage(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl KillSwitch for FlagKillSwitch {
    fn engaged(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn trip(&self, _reason: &str) -> Result<()> {
        self.engage();
        Ok(())
    }
}
