//! Two independently evictable scratch arenas for generated test files.
//!
//! ```text
//! <root>/writetests/       normal write-test artifacts
//! <root>/writetests_err/   quarantined mismatches + errors.log
//! ```
//!
//! Tiers are created on demand by the probes and only ever removed as a
//! whole by the disk capacity guard.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// Name of the append-only error log inside the quarantine tier.
pub const ERROR_LOG_NAME: &str = "errors.log";

/// Scratch tier, in eviction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchTier {
    Normal,
    Quarantine,
}

impl ScratchTier {
    pub const ALL: [ScratchTier; 2] = [ScratchTier::Normal, ScratchTier::Quarantine];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Normal => "writetests",
            Self::Quarantine => "writetests_err",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Quarantine => "quarantine",
        }
    }
}

/// Root directory holding both scratch tiers.
#[derive(Debug, Clone)]
pub struct ScratchArena {
    root: PathBuf,
}

impl ScratchArena {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tier_dir(&self, tier: ScratchTier) -> PathBuf {
        self.root.join(tier.dir_name())
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.tier_dir(ScratchTier::Quarantine).join(ERROR_LOG_NAME)
    }

    /// Create the tier directory if missing and return its path.
    pub fn ensure(&self, tier: ScratchTier) -> Result<PathBuf> {
        let dir = self.tier_dir(tier);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating scratch tier {}", dir.display()))?;
        Ok(dir)
    }

    /// Recursively delete a whole tier. Returns whether anything was removed.
    pub fn evict(&self, tier: ScratchTier) -> Result<bool> {
        let dir = self.tier_dir(tier);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(tier = tier.as_str(), path = %dir.display(), "evicted scratch tier");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("removing scratch tier {}", dir.display()))
            }
        }
    }
}
