use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::try_join_all;

use arbor_types::ObjectHash;

use crate::error::StoreResult;
use crate::object::{Record, StoredObject};

/// Backing store for content-addressed objects.
///
/// Implementations range from an in-process map to a remote RPC service of
/// arbitrary latency, which is why the contract is batched and async. All
/// implementations must satisfy these invariants:
/// - The hash is the one true identity; writing an object twice is a no-op.
/// - Concurrent reads are always safe.
/// - Errors are propagated, never swallowed.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Look up many objects in one round trip.
    ///
    /// The returned map has an entry for every requested hash; absent
    /// objects map to `None`.
    async fn get_all(
        &self,
        hashes: &[ObjectHash],
    ) -> StoreResult<HashMap<ObjectHash, Option<StoredObject>>>;

    /// Store many objects in one round trip.
    async fn put_all(&self, objects: Vec<StoredObject>) -> StoreResult<()>;

    /// Look up a single object.
    async fn get(&self, hash: &ObjectHash) -> StoreResult<Option<StoredObject>> {
        let mut found = self.get_all(std::slice::from_ref(hash)).await?;
        Ok(found.remove(hash).flatten())
    }

    /// Store a single object and return its hash.
    async fn put(&self, object: StoredObject) -> StoreResult<ObjectHash> {
        let hash = object.compute_hash();
        self.put_all(vec![object]).await?;
        Ok(hash)
    }
}

/// Resolves hashes to objects, failing with `NotFound` for unknown hashes.
///
/// This is the read interface trees and versions are built on. It is
/// implemented by the [`BulkQuery`](crate::BulkQuery) engine and by the
/// [`WriteBuffer`](crate::WriteBuffer) overlay of open transactions.
#[async_trait]
pub trait ObjectLoader: Send + Sync {
    async fn load(&self, hash: &ObjectHash) -> StoreResult<StoredObject>;

    /// Load several objects concurrently; order follows `hashes`.
    ///
    /// All lookups are issued before any is awaited, so a batching loader
    /// resolves them together.
    async fn load_all(&self, hashes: &[ObjectHash]) -> StoreResult<Vec<StoredObject>> {
        try_join_all(hashes.iter().map(|hash| self.load(hash))).await
    }
}

impl<'a> dyn ObjectLoader + 'a {
    /// Load and decode a typed record.
    pub async fn load_record<R: Record>(&self, hash: &ObjectHash) -> StoreResult<R> {
        let obj = self.load(hash).await?;
        R::from_stored_object(&obj)
    }

    /// Load and decode several typed records concurrently.
    pub async fn load_records<R: Record>(&self, hashes: &[ObjectHash]) -> StoreResult<Vec<R>> {
        self.load_all(hashes)
            .await?
            .iter()
            .map(R::from_stored_object)
            .collect()
    }
}
