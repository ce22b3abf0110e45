//! Error types for the orchestrator.
//!
//! Enqueue-time errors are returned to the caller. Errors raised while the
//! installation worker runs a task are caught at the task boundary, recorded
//! on the app as `Error` and published as an `InstallationFailed` event.

use std::path::PathBuf;

use harbor_core::AppName;
use harbor_store::AppStatus;
use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in orchestrator operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The app has no installation record.
    #[error("app not installed: {0}")]
    AppNotFound(AppName),

    /// An install was requested for an app that already has a record.
    #[error("app already installed: {0}")]
    AlreadyInstalled(AppName),

    /// The app store has no archive for the app.
    #[error("app {0} does not exist in the store")]
    AppNotInStore(AppName),

    /// No pre-staged archive exists for the app.
    #[error("archive not found for app {app}: {}", path.display())]
    ArchiveNotFound {
        /// The app being installed.
        app: AppName,
        /// Where the archive was expected.
        path: PathBuf,
    },

    /// The app's metadata file is missing or malformed.
    #[error("metadata not found for app {app}: {reason}")]
    MetadataNotFound {
        /// The app whose metadata was requested.
        app: AppName,
        /// Why the metadata could not be loaded.
        reason: String,
    },

    /// The worker picked up a task whose app is not in the expected status.
    #[error("illegal status for app {app}: expected {expected}, found {actual}")]
    IllegalStatus {
        /// The app being processed.
        app: AppName,
        /// The status the task requires.
        expected: AppStatus,
        /// The status actually recorded.
        actual: AppStatus,
    },

    /// The requested status transition is not an edge of the state machine.
    #[error("invalid status transition for app {app}: cannot go from {from} to {to}")]
    InvalidTransition {
        /// The app being transitioned.
        app: AppName,
        /// The current status.
        from: AppStatus,
        /// The requested status.
        to: AppStatus,
    },

    /// The container engine exited with a failure.
    #[error("compose {command} failed for app {app} (exit code {exit_code:?}): {stderr}")]
    Engine {
        /// The app the command ran for.
        app: AppName,
        /// The compose subcommand.
        command: String,
        /// Process exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Downloading from the app store failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The archive could not be read or extracted.
    #[error("archive error: {0}")]
    Archive(String),

    /// The compose template could not be rendered.
    #[error("template error: {0}")]
    Template(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] harbor_store::StoreError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Returns true for the recoverable not-found conditions.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AppNotFound(_)
                | Self::AppNotInStore(_)
                | Self::ArchiveNotFound { .. }
                | Self::MetadataNotFound { .. }
        )
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<zip::result::ZipError> for ControlError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}
