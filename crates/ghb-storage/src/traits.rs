//! The store interface consumed by the protocol engines.
//!
//! The engines are generic over [`GitStore`], so an in-memory
//! [`Repository`](crate::Repository), an on-disk store or a remote-backed
//! store can sit behind the same smart HTTP endpoints.

use crate::{GitObject, ObjectId, Reference, Repository, Result};
use std::sync::Arc;

/// Capabilities the smart HTTP engines need from an object store.
///
/// Implementations must be safe to share between concurrent requests.
/// [`GitStore::compare_and_swap_ref`] must be atomic with respect to every
/// other writer of the same reference.
pub trait GitStore: Send + Sync {
    /// Enumerates every reference, direct and symbolic.
    fn list_refs(&self) -> Result<Vec<(String, Reference)>>;

    /// Looks up a single reference without resolving it.
    fn find_ref(&self, name: &str) -> Result<Option<Reference>>;

    /// Resolves a reference to an object id, following symbolic references.
    fn resolve_ref(&self, name: &str) -> Result<ObjectId>;

    /// Reads an object by id.
    fn read_object(&self, id: &ObjectId) -> Result<GitObject>;

    /// Checks whether an object exists.
    fn has_object(&self, id: &ObjectId) -> Result<bool>;

    /// Writes a batch of new objects.
    fn write_objects(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>>;

    /// Atomically moves `name` from `expected` to `new`.
    ///
    /// `None` as `expected` requires the reference to be absent; `None` as
    /// `new` deletes it.
    fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<()>;
}

impl GitStore for Repository {
    fn list_refs(&self) -> Result<Vec<(String, Reference)>> {
        Ok(self.refs.list_all())
    }

    fn find_ref(&self, name: &str) -> Result<Option<Reference>> {
        Ok(self.refs.find(name))
    }

    fn resolve_ref(&self, name: &str) -> Result<ObjectId> {
        self.refs.resolve(name)
    }

    fn read_object(&self, id: &ObjectId) -> Result<GitObject> {
        self.objects.get(id)
    }

    fn has_object(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.contains(id))
    }

    fn write_objects(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>> {
        Ok(self.objects.put_all(objects))
    }

    fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<()> {
        let result = self.refs.compare_and_swap(name, expected, new);
        if result.is_ok() {
            tracing::debug!(ref_name = %name, ?expected, ?new, "Reference updated");
        }
        result
    }
}

// Implement GitStore for Arc<T> where T: GitStore
impl<T: GitStore + ?Sized> GitStore for Arc<T> {
    fn list_refs(&self) -> Result<Vec<(String, Reference)>> {
        (**self).list_refs()
    }

    fn find_ref(&self, name: &str) -> Result<Option<Reference>> {
        (**self).find_ref(name)
    }

    fn resolve_ref(&self, name: &str) -> Result<ObjectId> {
        (**self).resolve_ref(name)
    }

    fn read_object(&self, id: &ObjectId) -> Result<GitObject> {
        (**self).read_object(id)
    }

    fn has_object(&self, id: &ObjectId) -> Result<bool> {
        (**self).has_object(id)
    }

    fn write_objects(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>> {
        (**self).write_objects(objects)
    }

    fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<()> {
        (**self).compare_and_swap_ref(name, expected, new)
    }
}
