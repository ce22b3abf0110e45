//! Errors for parsing harbor's core value types.

use thiserror::Error;

use crate::ids::IdError;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised when parsing core types from configuration or metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// A host size outside `xs`, `s`, `m`, `l`, `xl`.
    #[error("unknown host size: {0}")]
    UnknownHostSize(String),
}
