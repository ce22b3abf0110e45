//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary installed-app records, keyed by app name.
    pub const APPS: &str = "apps";

    /// Index: apps by status, keyed by `status || name`.
    pub const APPS_BY_STATUS: &str = "apps_by_status";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::APPS, cf::APPS_BY_STATUS]
}
