use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use arbor_types::ObjectHash;

use crate::error::StoreResult;
use crate::object::{Record, StoredObject};
use crate::traits::ObjectLoader;

/// Staging overlay for objects a transaction has created but not committed.
///
/// Reads hit the staged set first and fall through to `base`. Nothing staged
/// here is visible to other readers of `base`; dropping the buffer discards
/// every staged object.
pub struct WriteBuffer {
    base: Arc<dyn ObjectLoader>,
    staged: Mutex<HashMap<ObjectHash, StoredObject>>,
}

impl WriteBuffer {
    pub fn new(base: Arc<dyn ObjectLoader>) -> Self {
        Self {
            base,
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Stage an object and return its hash.
    pub fn stage(&self, object: StoredObject) -> ObjectHash {
        let hash = object.compute_hash();
        self.staged
            .lock()
            .expect("lock poisoned")
            .entry(hash)
            .or_insert(object);
        hash
    }

    /// Serialize and stage a record.
    pub fn stage_record<R: Record>(&self, record: &R) -> StoreResult<ObjectHash> {
        Ok(self.stage(record.to_stored_object()?))
    }

    /// The staged object under `hash`, if any.
    pub fn staged(&self, hash: &ObjectHash) -> Option<StoredObject> {
        self.staged.lock().expect("lock poisoned").get(hash).cloned()
    }

    pub fn is_staged(&self, hash: &ObjectHash) -> bool {
        self.staged.lock().expect("lock poisoned").contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.staged.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The loader staged objects are layered on.
    pub fn base(&self) -> &Arc<dyn ObjectLoader> {
        &self.base
    }
}

#[async_trait]
impl ObjectLoader for WriteBuffer {
    async fn load(&self, hash: &ObjectHash) -> StoreResult<StoredObject> {
        if let Some(obj) = self.staged(hash) {
            return Ok(obj);
        }
        self.base.load(hash).await
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("staged", &self.len())
            .finish()
    }
}
