//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested object does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The requested reference does not exist.
    #[error("reference not found: {0}")]
    RefNotFound(String),

    /// Malformed object data or identifier.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Malformed or unusable reference.
    #[error("invalid reference: {0}")]
    InvalidRef(String),

    /// A compare-and-swap found a different value than expected.
    #[error("stale reference: {0}")]
    StaleRef(String),

    /// A corruption was detected.
    #[error("corruption detected: {0}")]
    Corruption(String),
}
