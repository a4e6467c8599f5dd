//! Disk usage ceiling for the destination volume.

use crate::error::SyncError;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{debug, warn};

/// Outcome of a disk usage check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiskStatus {
    /// Writing may continue.
    Ok,
    /// Used space has reached the configured maximum.
    OverLimit { used_percent: f64 },
}

/// Reports the used-space percentage of a volume.
pub trait UsageProbe: Send + Sync {
    fn used_percent(&self) -> Result<f64, SyncError>;
}

/// Reads usage of the mounted volume holding a path.
pub struct VolumeProbe {
    path: PathBuf,
}

impl VolumeProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UsageProbe for VolumeProbe {
    /// Picks the disk with the longest mount point containing the path, so a
    /// destination on a mounted card is not measured against `/`.
    fn used_percent(&self) -> Result<f64, SyncError> {
        let target = self
            .path
            .canonicalize()
            .unwrap_or_else(|_| self.path.clone());
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| {
                SyncError::IoError(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted volume holds {}", target.display()),
                ))
            })?;

        let total = disk.total_space();
        if total == 0 {
            return Err(SyncError::IoError(io::Error::other(format!(
                "volume {} reports zero capacity",
                disk.mount_point().display()
            ))));
        }
        let used = total.saturating_sub(disk.available_space());
        Ok(used as f64 * 100.0 / total as f64)
    }
}

/// Answers whether more data may be written under the destination.
pub struct DiskGuard {
    probe: Box<dyn UsageProbe>,
    max_percent: u8,
}

impl DiskGuard {
    /// Guard for the volume holding `destination`.
    pub fn new(destination: &Path, max_percent: u8) -> Self {
        Self::with_probe(Box::new(VolumeProbe::new(destination)), max_percent)
    }

    pub fn with_probe(probe: Box<dyn UsageProbe>, max_percent: u8) -> Self {
        Self { probe, max_percent }
    }

    /// Checks current usage against the maximum.
    ///
    /// A failing probe is logged and treated as [`DiskStatus::Ok`].
    pub fn check(&self) -> DiskStatus {
        match self.probe.used_percent() {
            Ok(used) if used >= f64::from(self.max_percent) => DiskStatus::OverLimit {
                used_percent: used,
            },
            Ok(used) => {
                debug!("Disk usage {:.1}% (limit {}%)", used, self.max_percent);
                DiskStatus::Ok
            }
            Err(e) => {
                warn!("Could not determine disk usage, continuing: {}", e);
                DiskStatus::Ok
            }
        }
    }
}
