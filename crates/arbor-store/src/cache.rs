use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use arbor_types::ObjectHash;

use crate::object::StoredObject;

/// Bounded LRU cache of stored objects, keyed by hash.
///
/// Content addressing means an entry can never become stale, so the cache
/// only ever evicts for space. A capacity of zero disables it entirely.
#[derive(Debug, Default)]
pub enum ObjectCache {
    #[default]
    Disabled,
    Shared(Mutex<LruCache<ObjectHash, StoredObject>>),
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        let Some(capacity) = NonZeroUsize::new(capacity) else {
            return Self::Disabled;
        };
        Self::Shared(Mutex::new(LruCache::new(capacity)))
    }

    pub fn get(&self, hash: &ObjectHash) -> Option<StoredObject> {
        let Self::Shared(cache) = self else {
            return None;
        };
        cache.lock().expect("lock poisoned").get(hash).cloned()
    }

    pub fn put(&self, hash: ObjectHash, object: StoredObject) {
        if let Self::Shared(cache) = self {
            cache.lock().expect("lock poisoned").put(hash, object);
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Shared(cache) => cache.lock().expect("lock poisoned").len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
