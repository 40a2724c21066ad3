//! Object store and repository.

use crate::{GitObject, ObjectId, RefStore, Reference, Result, StorageError, HEAD};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Content-addressed object store.
#[derive(Debug, Default)]
pub struct ObjectStore {
    /// Objects indexed by their SHA-1 hash.
    objects: RwLock<HashMap<ObjectId, GitObject>>,
}

impl ObjectStore {
    /// Creates a new empty object store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object and returns its ID.
    pub fn put(&self, object: GitObject) -> ObjectId {
        let id = object.id;
        self.objects.write().insert(id, object);
        id
    }

    /// Stores a batch of objects under a single lock acquisition.
    pub fn put_all(&self, objects: Vec<GitObject>) -> Vec<ObjectId> {
        let mut map = self.objects.write();
        objects
            .into_iter()
            .map(|object| {
                let id = object.id;
                map.insert(id, object);
                id
            })
            .collect()
    }

    /// Retrieves an object by ID.
    pub fn get(&self, id: &ObjectId) -> Result<GitObject> {
        self.objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))
    }

    /// Checks if an object exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Returns the number of objects in the store.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Lists all object IDs.
    pub fn list_objects(&self) -> Vec<ObjectId> {
        self.objects.read().keys().copied().collect()
    }

    /// Stores a blob and returns its ID.
    pub fn put_blob(&self, content: impl Into<Bytes>) -> ObjectId {
        self.put(GitObject::blob(content))
    }
}

/// An in-memory git repository with objects and references.
#[derive(Debug)]
pub struct Repository {
    /// Object store.
    pub objects: ObjectStore,
    /// Reference store.
    pub refs: RefStore,
}

impl Repository {
    /// Creates a new empty repository whose HEAD points at `refs/heads/main`.
    pub fn new() -> Self {
        Self::with_default_branch("main")
    }

    /// Creates a new empty repository with HEAD pointing at the given branch.
    pub fn with_default_branch(branch: &str) -> Self {
        let refs = RefStore::new();
        refs.set_symbolic(HEAD, &format!("refs/heads/{}", branch));

        Self {
            objects: ObjectStore::new(),
            refs,
        }
    }

    /// Creates a repository without any references, not even HEAD.
    pub fn bare() -> Self {
        Self {
            objects: ObjectStore::new(),
            refs: RefStore::new(),
        }
    }

    /// Gets the current HEAD commit.
    pub fn head(&self) -> Result<ObjectId> {
        self.refs.resolve_head()
    }

    /// Gets the current branch name.
    pub fn current_branch(&self) -> Option<String> {
        self.refs.current_branch()
    }

    /// Creates a new commit on top of HEAD and advances the current branch.
    pub fn commit(
        &self,
        tree_id: &ObjectId,
        message: &str,
        author: &str,
        committer: &str,
    ) -> Result<ObjectId> {
        let parents: Vec<ObjectId> = match self.head() {
            Ok(head) => vec![head],
            Err(_) => vec![], // First commit has no parents
        };

        let commit = GitObject::commit(tree_id, &parents, author, committer, message);
        let commit_id = self.objects.put(commit);

        if let Some(branch) = self.current_branch() {
            self.refs.set(&format!("refs/heads/{}", branch), commit_id);
        } else {
            // Detached HEAD - update HEAD directly
            self.refs.set(HEAD, commit_id);
        }

        Ok(commit_id)
    }

    /// Lists all references.
    pub fn list_refs(&self) -> Vec<(String, Reference)> {
        self.refs.list_all()
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}
