//! Git reference management.

use crate::{ObjectId, Result, StorageError};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Name of the HEAD reference.
pub const HEAD: &str = "HEAD";

/// Symbolic chains longer than this are treated as broken.
const MAX_SYMREF_DEPTH: usize = 5;

/// A git reference (branch, tag, or symbolic ref).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference (e.g., HEAD -> refs/heads/main).
    Symbolic(String),
}

impl Reference {
    /// Returns the object ID if this is a direct reference.
    pub fn as_direct(&self) -> Option<ObjectId> {
        match self {
            Self::Direct(id) => Some(*id),
            Self::Symbolic(_) => None,
        }
    }
}

/// Thread-safe reference store.
///
/// Every mutation happens under the write lock, so a compare-and-swap is a
/// single read-compare-write unit with respect to all other writers.
#[derive(Debug, Default)]
pub struct RefStore {
    refs: RwLock<HashMap<String, Reference>>,
}

impl RefStore {
    /// Creates a new empty reference store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a reference by name.
    pub fn get(&self, name: &str) -> Result<Reference> {
        self.find(name)
            .ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Gets a reference by name, if present.
    pub fn find(&self, name: &str) -> Option<Reference> {
        self.refs.read().get(name).cloned()
    }

    /// Sets a reference to point to an object.
    pub fn set(&self, name: &str, target: ObjectId) {
        self.refs
            .write()
            .insert(name.to_string(), Reference::Direct(target));
    }

    /// Sets a symbolic reference.
    pub fn set_symbolic(&self, name: &str, target: &str) {
        self.refs
            .write()
            .insert(name.to_string(), Reference::Symbolic(target.to_string()));
    }

    /// Deletes a reference.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.refs
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Atomically moves a direct reference from `expected` to `new`.
    ///
    /// `None` as `expected` means the reference must not exist yet; `None` as
    /// `new` deletes it. Fails with [`StorageError::StaleRef`] when the stored
    /// value differs from `expected`.
    pub fn compare_and_swap(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<()> {
        let mut refs = self.refs.write();

        let current = match refs.get(name) {
            Some(Reference::Direct(id)) => Some(*id),
            Some(Reference::Symbolic(_)) => {
                return Err(StorageError::InvalidRef(format!(
                    "{} is symbolic and cannot be updated directly",
                    name
                )))
            }
            None => None,
        };

        if current != expected {
            return Err(StorageError::StaleRef(name.to_string()));
        }

        match new {
            Some(id) => {
                refs.insert(name.to_string(), Reference::Direct(id));
            }
            None => {
                refs.remove(name);
            }
        }
        Ok(())
    }

    /// Lists all references with a given prefix.
    pub fn list(&self, prefix: &str) -> Vec<(String, Reference)> {
        self.refs
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, refr)| (name.clone(), refr.clone()))
            .collect()
    }

    /// Lists all references.
    pub fn list_all(&self) -> Vec<(String, Reference)> {
        self.list("")
    }

    /// Resolves a reference, following symbolic links, to an object ID.
    pub fn resolve(&self, name: &str) -> Result<ObjectId> {
        let refs = self.refs.read();
        let mut current = name.to_string();
        for _ in 0..MAX_SYMREF_DEPTH {
            match refs.get(&current) {
                Some(Reference::Direct(id)) => return Ok(*id),
                Some(Reference::Symbolic(target)) => current = target.clone(),
                None => return Err(StorageError::RefNotFound(current)),
            }
        }
        Err(StorageError::InvalidRef(format!(
            "symbolic reference chain too deep: {}",
            name
        )))
    }

    /// Resolves HEAD to find the current commit.
    pub fn resolve_head(&self) -> Result<ObjectId> {
        self.resolve(HEAD)
    }

    /// Gets the current branch name (if HEAD is symbolic).
    pub fn current_branch(&self) -> Option<String> {
        match self.find(HEAD)? {
            Reference::Symbolic(target) => {
                target.strip_prefix("refs/heads/").map(|s| s.to_string())
            }
            Reference::Direct(_) => None,
        }
    }

    /// Returns true if no references exist at all.
    pub fn is_empty(&self) -> bool {
        self.refs.read().is_empty()
    }
}
