use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use arbor_types::ObjectHash;

use crate::error::StoreResult;
use crate::object::StoredObject;
use crate::traits::ObjectStore;

/// In-memory, HashMap-based object store.
///
/// Intended for tests, embedding, and as the storage of a local head
/// service. Objects live behind a `RwLock`; locks are never held across an
/// await point.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectHash, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Total payload bytes across all stored objects.
    pub fn total_bytes(&self) -> usize {
        self.objects
            .read()
            .expect("lock poisoned")
            .values()
            .map(StoredObject::size)
            .sum()
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        self.objects.read().expect("lock poisoned").contains_key(hash)
    }

    /// All stored hashes, sorted.
    pub fn all_hashes(&self) -> Vec<ObjectHash> {
        let map = self.objects.read().expect("lock poisoned");
        let mut hashes: Vec<ObjectHash> = map.keys().copied().collect();
        hashes.sort();
        hashes
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get_all(
        &self,
        hashes: &[ObjectHash],
    ) -> StoreResult<HashMap<ObjectHash, Option<StoredObject>>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(hashes
            .iter()
            .map(|hash| (*hash, map.get(hash).cloned()))
            .collect())
    }

    async fn put_all(&self, objects: Vec<StoredObject>) -> StoreResult<()> {
        let mut map = self.objects.write().expect("lock poisoned");
        for object in objects {
            // Idempotent: the same hash always maps to the same content.
            map.entry(object.compute_hash()).or_insert(object);
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("object_count", &self.len())
            .finish()
    }
}
