//! Key encoding utilities for `RocksDB`.
//!
//! App names are valid UTF-8 and never empty, so they are stored verbatim.
//! Index keys prefix the name with a single status byte to support prefix scans.

use harbor_core::AppName;

/// Encode an app key (just the name bytes).
#[must_use]
pub fn app_key(name: &AppName) -> Vec<u8> {
    name.as_bytes().to_vec()
}

/// Encode a status-app index key: `status || name`.
#[must_use]
pub fn status_app_key(status: u8, name: &AppName) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.as_bytes().len());
    key.push(status);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Encode a status prefix for scanning all apps by status.
#[must_use]
pub fn status_prefix(status: u8) -> Vec<u8> {
    vec![status]
}

/// Extract the app name from a status-app key.
///
/// Returns `None` if the key is too short or the name is no longer valid.
#[must_use]
pub fn extract_name_from_status_app_key(key: &[u8]) -> Option<AppName> {
    let name = std::str::from_utf8(key.get(1..)?).ok()?;
    AppName::new(name).ok()
}
