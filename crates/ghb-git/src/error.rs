//! Git protocol error types.

use ghb_storage::ObjectId;
use thiserror::Error;

/// Errors that can occur during git protocol operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Malformed pkt-line framing (bad length header, truncated frame).
    #[error("invalid pkt-line: {0}")]
    Framing(String),

    /// A pkt-line payload larger than the protocol allows.
    #[error("pkt-line payload of {0} bytes exceeds the maximum of {max}", max = crate::pktline::MAX_PAYLOAD_LEN)]
    Length(usize),

    /// Invalid pack file format.
    #[error("invalid pack file: {0}")]
    InvalidPack(String),

    /// A request line the protocol grammar does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An object required by the request is missing from the store.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// HEAD could not be resolved while references exist.
    #[error("HEAD cannot be resolved: {0}")]
    NoHead(String),

    /// The per-request deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] ghb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
