//! Storage Planner
//!
//! Decides, once per run, whether the update fits and whether per-file
//! replacement must fall back to incremental space reclamation.

use super::format::UpdateRecord;
use crate::engine::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

/// Fixed for the whole run once computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDecision {
    pub requires_shadow_fallback: bool,
}

/// Source of free-space figures for a mounted filesystem
pub trait SpaceProbe {
    /// Bytes available on the filesystem backing `mount_point`
    fn free_space(&self, mount_point: &Path) -> io::Result<u64>;
}

impl<P: SpaceProbe + ?Sized> SpaceProbe for &P {
    fn free_space(&self, mount_point: &Path) -> io::Result<u64> {
        (**self).free_space(mount_point)
    }
}

/// `statvfs(2)` backed probe
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn free_space(&self, mount_point: &Path) -> io::Result<u64> {
        let stat = rustix::fs::statvfs(mount_point).map_err(io::Error::from)?;
        // Blocks available to unprivileged writers, never the reserved pool
        Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
    }
}

/// Probe returning a constant; useful for dry runs and tests
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub u64);

impl SpaceProbe for FixedProbe {
    fn free_space(&self, _mount_point: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Pure planning decision against a known free-space figure
pub fn plan_with_free_space(bytes_added: u64, bytes_removed: u64, free_space: u64) -> Result<StorageDecision> {
    let delta = bytes_added.saturating_sub(bytes_removed);
    if delta >= free_space {
        return Err(UpdateError::InsufficientStorage {
            required: delta,
            available: free_space,
        });
    }
    Ok(StorageDecision {
        requires_shadow_fallback: bytes_added >= free_space,
    })
}

pub struct StoragePlanner<P> {
    probe: P,
}

impl<P: SpaceProbe> StoragePlanner<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Read free space for `mount_point` and decide the strategy
    pub fn plan(&self, bytes_added: u64, bytes_removed: u64, mount_point: &Path) -> Result<StorageDecision> {
        let free_space = self.probe.free_space(mount_point)?;
        let decision = plan_with_free_space(bytes_added, bytes_removed, free_space)?;
        info!(
            bytes_added,
            bytes_removed,
            free_space,
            shadow_fallback = decision.requires_shadow_fallback,
            "storage planned"
        );
        Ok(decision)
    }
}

/// Bounds net growth committed between free-space checks while the
/// shadow fallback is active
#[derive(Debug, Clone)]
pub struct GrowthBudget {
    limit: u64,
    committed: u64,
}

impl GrowthBudget {
    pub fn new(limit: u64) -> Self {
        Self { limit, committed: 0 }
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Account for `record` before it is applied, re-probing free space when
    /// the budget would be exceeded
    pub fn admit<P: SpaceProbe>(&mut self, record: &UpdateRecord, probe: &P, mount_point: &Path) -> Result<()> {
        let growth = record.bytes_added.saturating_sub(record.bytes_removed);

        if self.committed.saturating_add(growth) > self.limit {
            let free_space = probe.free_space(mount_point)?;
            debug!(free_space, committed = self.committed, "re-validating free space");
            if record.bytes_added >= free_space {
                warn!(path = %record.path.display(), "record does not fit in remaining space");
                return Err(UpdateError::InsufficientStorage {
                    required: record.bytes_added,
                    available: free_space,
                });
            }
            self.committed = 0;
        }

        self.committed = self.committed.saturating_add(growth);
        Ok(())
    }
}
