//! Disk pressure and host signals.
//!
//! `HostState` holds the signals the lifecycle controller gates on: the latest
//! disk usage and the size assigned to the host. `DiskMonitor` refreshes the
//! disk usage periodically from the filesystem holding the data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use harbor_core::HostSize;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::periodic::spawn_periodic;

/// Free space below which the disk counts as low.
pub const LOW_DISK_THRESHOLD_GB: f64 = 1.0;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Space on the filesystem holding the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    /// Total size in GB.
    pub total_gb: f64,
    /// Free space in GB.
    pub free_gb: f64,
}

impl DiskUsage {
    /// Build from byte counts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_bytes(total: u64, free: u64) -> Self {
        Self {
            total_gb: total as f64 / BYTES_PER_GB,
            free_gb: free as f64 / BYTES_PER_GB,
        }
    }

    /// Returns true when free space is under `LOW_DISK_THRESHOLD_GB`.
    #[must_use]
    pub fn is_low(&self) -> bool {
        self.free_gb < LOW_DISK_THRESHOLD_GB
    }
}

/// Host signals consumed by the lifecycle controller.
#[derive(Debug, Default)]
pub struct HostState {
    disk: RwLock<Option<DiskUsage>>,
    host_size: RwLock<Option<HostSize>>,
}

impl HostState {
    /// Create a state with the given host size and no disk reading yet.
    #[must_use]
    pub fn new(host_size: Option<HostSize>) -> Self {
        Self {
            disk: RwLock::new(None),
            host_size: RwLock::new(host_size),
        }
    }

    /// Record a disk usage reading.
    pub fn set_disk_usage(&self, usage: DiskUsage) {
        let was_low = self.disk_is_low();
        *self.disk.write() = Some(usage);

        if usage.is_low() && !was_low {
            tracing::warn!(free_gb = usage.free_gb, "Disk space is low");
        } else if !usage.is_low() && was_low {
            tracing::info!(free_gb = usage.free_gb, "Disk space recovered");
        }
    }

    /// Latest disk usage reading.
    #[must_use]
    pub fn disk_usage(&self) -> Option<DiskUsage> {
        *self.disk.read()
    }

    /// Returns true if the latest reading is low. No reading is not low.
    #[must_use]
    pub fn disk_is_low(&self) -> bool {
        self.disk.read().is_some_and(|usage| usage.is_low())
    }

    /// Record the size assigned to the host.
    pub fn set_host_size(&self, size: Option<HostSize>) {
        *self.host_size.write() = size;
        tracing::info!(host_size = ?size, "Host size updated");
    }

    /// The size assigned to the host, if known.
    #[must_use]
    pub fn host_size(&self) -> Option<HostSize> {
        *self.host_size.read()
    }
}

/// Periodically samples the disk holding a path.
#[derive(Debug, Clone)]
pub struct DiskMonitor {
    path: PathBuf,
    state: Arc<HostState>,
}

impl DiskMonitor {
    /// Create a monitor for the filesystem holding `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, state: Arc<HostState>) -> Self {
        Self {
            path: path.into(),
            state,
        }
    }

    /// Read usage of the filesystem holding the monitored path.
    #[must_use]
    pub fn sample(&self) -> Option<DiskUsage> {
        let disks = Disks::new_with_refreshed_list();
        let mounts = disks
            .list()
            .iter()
            .map(|disk| (disk.mount_point(), disk.total_space(), disk.available_space()));

        best_mount(&self.path, mounts).map(|(total, free)| DiskUsage::from_bytes(total, free))
    }

    /// Sample once and publish the reading.
    pub fn refresh(&self) {
        match self.sample() {
            Some(usage) => {
                tracing::debug!(
                    total_gb = usage.total_gb,
                    free_gb = usage.free_gb,
                    "Disk usage sampled"
                );
                self.state.set_disk_usage(usage);
            }
            None => tracing::warn!(path = %self.path.display(), "No disk found for data directory"),
        }
    }

    /// Sample every `period` until cancelled.
    pub fn spawn(self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_periodic("disk-monitor", period, cancel, move || {
            let monitor = self.clone();
            async move {
                if let Err(e) = tokio::task::spawn_blocking(move || monitor.refresh()).await {
                    tracing::warn!(error = %e, "Disk sampling task failed");
                }
            }
        })
    }
}

/// Pick the mount with the longest mount point that contains `path`.
fn best_mount<'a>(
    path: &Path,
    mounts: impl Iterator<Item = (&'a Path, u64, u64)>,
) -> Option<(u64, u64)> {
    mounts
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(_, total, free)| (total, free))
}
