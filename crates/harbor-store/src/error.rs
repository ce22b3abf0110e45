//! Error types for the app record store.

use harbor_core::AppName;
use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while reading or writing app records.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the app.
    #[error("no record for app {0}")]
    NotFound(AppName),

    /// A record already exists for the app.
    #[error("app {0} already has a record")]
    AlreadyExists(AppName),

    /// `RocksDB` rejected the operation.
    #[error("rocksdb error: {0}")]
    Database(#[from] rocksdb::Error),

    /// The database was opened without one of the expected column families.
    #[error("missing column family: {0}")]
    MissingColumnFamily(String),

    /// A record could not be encoded as CBOR.
    #[error("failed to encode app record: {0}")]
    Encode(String),

    /// A stored record could not be decoded.
    #[error("corrupt app record: {0}")]
    Decode(String),
}
