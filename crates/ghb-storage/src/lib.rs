//! Git object storage for ghb.
//!
//! This crate provides content-addressed storage for git objects
//! (blobs, trees, commits, tags), the reference namespace, and the
//! [`GitStore`] trait through which the protocol engines reach a store.

mod error;
mod object;
mod refs;
mod store;
mod traits;

pub use error::StorageError;
pub use object::{CommitHeader, GitObject, ObjectId, ObjectType, TreeEntry};
pub use refs::{RefStore, Reference, HEAD};
pub use store::{ObjectStore, Repository};
pub use traits::GitStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
