//! Domain types stored in the database.
//!
//! These types represent the persisted state of installed applications.

use std::fmt;

use chrono::{DateTime, Utc};
use harbor_core::AppName;
use serde::{Deserialize, Serialize};

/// An installed application record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApp {
    /// Unique application name, the primary key.
    pub name: AppName,
    /// Why the application was installed. Informational only.
    pub installation_reason: InstallationReason,
    /// Current lifecycle status.
    pub status: AppStatus,
    /// Last time a request was routed to the application.
    pub last_access: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Why the application entered `Error`, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl InstalledApp {
    /// Create a new record in the given status.
    #[must_use]
    pub fn new(name: AppName, reason: InstallationReason, status: AppStatus) -> Self {
        let now = Utc::now();
        Self {
            name,
            installation_reason: reason,
            status,
            last_access: None,
            created_at: now,
            updated_at: now,
            error_message: None,
        }
    }
}

/// Why an application exists on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallationReason {
    /// Origin not recorded.
    #[default]
    Unknown,
    /// Installed because the host configuration lists it.
    Config,
    /// Installed from an archive placed on the host by an operator.
    Custom,
    /// Installed from the app store.
    Store,
}

/// Lifecycle status of an installed application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AppStatus {
    /// Waiting in the installation queue.
    InstallationQueued = 1,
    /// The installation workflow is running.
    Installing = 2,
    /// Containers exist but are not running.
    Stopped = 3,
    /// Containers are running.
    Running = 4,
    /// Containers have been removed.
    Down = 5,
    /// Waiting in the queue for removal.
    UninstallationQueued = 6,
    /// The uninstall workflow is running.
    Uninstalling = 7,
    /// Waiting in the queue for reinstallation.
    ReinstallationQueued = 8,
    /// The reinstall workflow is running.
    Reinstalling = 9,
    /// A workflow failed; needs an explicit reinstall or uninstall.
    Error = 10,
}

impl AppStatus {
    /// All statuses, in numeric order.
    pub const ALL: [Self; 10] = [
        Self::InstallationQueued,
        Self::Installing,
        Self::Stopped,
        Self::Running,
        Self::Down,
        Self::UninstallationQueued,
        Self::Uninstalling,
        Self::ReinstallationQueued,
        Self::Reinstalling,
        Self::Error,
    ];

    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// The snake case name, as serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InstallationQueued => "installation_queued",
            Self::Installing => "installing",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Down => "down",
            Self::UninstallationQueued => "uninstallation_queued",
            Self::Uninstalling => "uninstalling",
            Self::ReinstallationQueued => "reinstallation_queued",
            Self::Reinstalling => "reinstalling",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a conditional status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The new status was written. Holds the status it replaced.
    Applied(AppStatus),
    /// The recorded status was refused and nothing was written. Holds the
    /// recorded status.
    Rejected(AppStatus),
}
