use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::scratch::{ScratchArena, ScratchTier};

/// Default free-space threshold in MB (10^6 bytes).
pub const DEFAULT_THRESHOLD_MB: u64 = 1000;

const BYTES_PER_MB: u64 = 1_000_000;

/// Reports free space available to unprivileged writers.
pub trait FreeSpace: Send + Sync {
    fn available_bytes(&self) -> Result<u64>;
}

/// `statvfs(2)` on a path: `f_bavail * f_frsize`.
#[derive(Debug, Clone)]
pub struct StatvfsFreeSpace {
    path: PathBuf,
}

impl StatvfsFreeSpace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FreeSpace for StatvfsFreeSpace {
    fn available_bytes(&self) -> Result<u64> {
        let target = existing_ancestor(&self.path);
        let stat = nix::sys::statvfs::statvfs(target)
            .with_context(|| format!("statvfs {}", target.display()))?;

        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }
}

/// The scratch root may not exist before the first probe writes into it,
/// so measure the filesystem of its closest existing ancestor.
fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or_else(|| Path::new("."))
}

/// Deepest scratch tier evicted by one [`DiskCapacityGuard::enforce`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Free space was at or above the threshold.
    None,
    /// The normal tier was evicted and that was enough.
    Normal,
    /// Both tiers were evicted.
    Both,
}

/// Result of one enforcement pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardReport {
    pub eviction: Eviction,
    /// Free space after the last check.
    pub available_bytes: u64,
}

/// Evicts scratch tiers, normal first, while free space is below a threshold.
pub struct DiskCapacityGuard {
    arena: ScratchArena,
    threshold_bytes: u64,
    free_space: Box<dyn FreeSpace>,
}

impl DiskCapacityGuard {
    pub fn new(arena: ScratchArena, threshold_mb: u64, free_space: Box<dyn FreeSpace>) -> Self {
        Self {
            arena,
            threshold_bytes: threshold_mb.saturating_mul(BYTES_PER_MB),
            free_space,
        }
    }

    /// Check free space and evict tiers in order until it clears the
    /// threshold or both tiers are gone. Running low after evicting both
    /// is reported, not retried.
    pub fn enforce(&self) -> Result<GuardReport> {
        let mut available = self.free_space.available_bytes()?;
        info!(free_mb = available / BYTES_PER_MB, "checked free space");

        if available >= self.threshold_bytes {
            return Ok(GuardReport {
                eviction: Eviction::None,
                available_bytes: available,
            });
        }

        let mut eviction = Eviction::None;
        for tier in ScratchTier::ALL {
            info!(
                tier = tier.as_str(),
                free_mb = available / BYTES_PER_MB,
                threshold_mb = self.threshold_bytes / BYTES_PER_MB,
                "free space below threshold, evicting scratch tier"
            );
            self.arena.evict(tier)?;
            eviction = match tier {
                ScratchTier::Normal => Eviction::Normal,
                ScratchTier::Quarantine => Eviction::Both,
            };

            available = self.free_space.available_bytes()?;
            if available >= self.threshold_bytes {
                break;
            }
        }

        if available < self.threshold_bytes {
            warn!(
                free_mb = available / BYTES_PER_MB,
                "free space still below threshold after evicting all scratch tiers"
            );
        }

        Ok(GuardReport {
            eviction,
            available_bytes: available,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;

    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;

    /// Replays a fixed sequence of readings, repeating the last one.
    struct Readings(Mutex<VecDeque<u64>>);

    impl Readings {
        fn mb(values: &[u64]) -> Box<Self> {
            Box::new(Self(Mutex::new(
                values.iter().map(|v| v * BYTES_PER_MB).collect(),
            )))
        }
    }

    impl FreeSpace for Readings {
        fn available_bytes(&self) -> Result<u64> {
            let mut q = self.0.lock();
            if q.len() > 1 {
                Ok(q.pop_front().unwrap_or_default())
            } else {
                Ok(q.front().copied().unwrap_or_default())
            }
        }
    }

    fn populated_arena(dir: &TempDir) -> ScratchArena {
        let arena = ScratchArena::new(dir.path());
        for tier in ScratchTier::ALL {
            let path = arena.ensure(tier).expect("ensure");
            fs::write(path.join("file.test"), b"data").expect("write");
        }
        arena
    }

    #[test]
    fn test_enough_space_evicts_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let arena = populated_arena(&dir);
        let guard = DiskCapacityGuard::new(arena.clone(), 1000, Readings::mb(&[1000]));

        let report = guard.enforce().expect("enforce");
        assert_eq!(report.eviction, Eviction::None);
        assert!(arena.tier_dir(ScratchTier::Normal).exists());
        assert!(arena.tier_dir(ScratchTier::Quarantine).exists());
    }

    #[test]
    fn test_normal_tier_first_and_quarantine_untouched() {
        let dir = TempDir::new().expect("temp dir");
        let arena = populated_arena(&dir);
        let guard = DiskCapacityGuard::new(arena.clone(), 1000, Readings::mb(&[500, 1500]));

        let report = guard.enforce().expect("enforce");
        assert_eq!(report.eviction, Eviction::Normal);
        assert_eq!(report.available_bytes, 1500 * BYTES_PER_MB);
        assert!(!arena.tier_dir(ScratchTier::Normal).exists());
        assert!(arena.tier_dir(ScratchTier::Quarantine).join("file.test").exists());
    }

    #[test]
    fn test_both_tiers_when_still_low() {
        let dir = TempDir::new().expect("temp dir");
        let arena = populated_arena(&dir);
        let guard = DiskCapacityGuard::new(arena.clone(), 1000, Readings::mb(&[100, 200, 300]));

        let report = guard.enforce().expect("enforce");
        assert_eq!(report.eviction, Eviction::Both);
        assert_eq!(report.available_bytes, 300 * BYTES_PER_MB);
        assert!(!arena.tier_dir(ScratchTier::Normal).exists());
        assert!(!arena.tier_dir(ScratchTier::Quarantine).exists());
    }

    #[test]
    fn test_missing_tiers_are_tolerated() {
        let dir = TempDir::new().expect("temp dir");
        let arena = ScratchArena::new(dir.path());
        let guard = DiskCapacityGuard::new(arena, 1000, Readings::mb(&[1]));

        let report = guard.enforce().expect("enforce");
        assert_eq!(report.eviction, Eviction::Both);
    }

    #[test]
    fn test_statvfs_reports_space_for_temp_dir() {
        let dir = TempDir::new().expect("temp dir");
        let probe = StatvfsFreeSpace::new(dir.path());
        assert!(probe.available_bytes().is_ok());
    }

    #[test]
    fn test_statvfs_falls_back_to_existing_ancestor() {
        let dir = TempDir::new().expect("temp dir");
        let probe = StatvfsFreeSpace::new(dir.path().join("not").join("yet"));
        assert!(probe.available_bytes().is_ok());
        assert_eq!(existing_ancestor(probe.path()), dir.path());
    }
}
