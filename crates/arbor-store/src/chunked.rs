use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use arbor_types::ObjectHash;

use crate::error::StoreResult;
use crate::object::StoredObject;
use crate::traits::ObjectStore;

/// Splits large requests into bounded chunks before they reach a backend.
///
/// Remote backends cap the number of keys per request; wrapping them in a
/// `ChunkedStore` lets callers pass arbitrarily large key sets.
pub struct ChunkedStore {
    inner: Arc<dyn ObjectStore>,
    max_keys: usize,
}

impl ChunkedStore {
    /// `max_keys` is clamped to at least one.
    pub fn new(inner: Arc<dyn ObjectStore>, max_keys: usize) -> Self {
        Self {
            inner,
            max_keys: max_keys.max(1),
        }
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }
}

#[async_trait]
impl ObjectStore for ChunkedStore {
    async fn get_all(
        &self,
        hashes: &[ObjectHash],
    ) -> StoreResult<HashMap<ObjectHash, Option<StoredObject>>> {
        let mut result = HashMap::with_capacity(hashes.len());
        for chunk in hashes.chunks(self.max_keys) {
            trace!(keys = chunk.len(), "chunked get_all");
            result.extend(self.inner.get_all(chunk).await?);
        }
        Ok(result)
    }

    async fn put_all(&self, objects: Vec<StoredObject>) -> StoreResult<()> {
        let mut objects = objects;
        while !objects.is_empty() {
            let rest = objects.split_off(objects.len().min(self.max_keys));
            self.inner.put_all(objects).await?;
            objects = rest;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChunkedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedStore")
            .field("max_keys", &self.max_keys)
            .finish()
    }
}
