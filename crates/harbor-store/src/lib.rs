//! `RocksDB` record store for harbor.
//!
//! This crate persists one record per installed application, keyed by name,
//! holding its status, installation reason and last access time.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `apps`: Primary installed-app records, keyed by app name
//! - `apps_by_status`: Index for listing apps by status
//!
//! Every write holds one store-wide lock, so the conditional operations
//! ([`Store::insert_app`], [`Store::compare_and_set_status`]) check and write
//! without another writer slipping in between.
//!
//! # Example
//!
//! ```no_run
//! use harbor_store::{AppStatus, RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/harbor-db").unwrap();
//!
//! // List apps waiting to be installed
//! let queued = store.list_apps_by_status(AppStatus::InstallationQueued).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{AppStatus, InstallationReason, InstalledApp, StatusChange};

use chrono::{DateTime, Utc};
use harbor_core::AppName;

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory or instrumented wrappers for testing).
pub trait Store: Send + Sync {
    /// Insert or update an app record.
    ///
    /// This also maintains the status index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_app(&self, app: &InstalledApp) -> Result<()>;

    /// Insert a record for an app that has none.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the app already has a record.
    fn insert_app(&self, app: &InstalledApp) -> Result<()>;

    /// Get an app by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_app(&self, name: &AppName) -> Result<Option<InstalledApp>>;

    /// Delete an app by name.
    ///
    /// This also removes the app from the status index.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the app doesn't exist.
    fn delete_app(&self, name: &AppName) -> Result<()>;

    /// List all installed apps, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_apps(&self) -> Result<Vec<InstalledApp>>;

    /// List all apps with a given status, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_apps_by_status(&self, status: AppStatus) -> Result<Vec<InstalledApp>>;

    /// Update an app's status.
    ///
    /// Moving to any status other than `Error` clears the recorded error message.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the app doesn't exist.
    fn update_app_status(&self, name: &AppName, status: AppStatus) -> Result<()>;

    /// Set an app's status if `allow` accepts the recorded one.
    ///
    /// The check and the write happen under the store's write lock. Like
    /// [`Store::update_app_status`], a move away from `Error` clears the
    /// error message.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the app doesn't exist.
    fn compare_and_set_status(
        &self,
        name: &AppName,
        status: AppStatus,
        allow: &dyn Fn(AppStatus) -> bool,
    ) -> Result<StatusChange>;

    /// Update an app's status with an error message.
    ///
    /// Use this when transitioning to `Error` to record the reason.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the app doesn't exist.
    fn update_app_error(
        &self,
        name: &AppName,
        status: AppStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    /// Record that a request was routed to the app at `at`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the app doesn't exist.
    fn record_access(&self, name: &AppName, at: DateTime<Utc>) -> Result<()>;
}
