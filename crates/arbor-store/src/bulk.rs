//! The bulk query engine.
//!
//! Tree traversals issue one lookup per hash they meet. [`BulkQuery`] turns
//! those scattered lookups into few backend round trips:
//!
//! - a cache hit never reaches the queue;
//! - a request for a hash that is already queued or in flight joins the
//!   existing request instead of issuing a new one;
//! - a new request is queued and the requester yields once to the executor,
//!   giving sibling lookups (e.g. the other children of a trie node awaited
//!   with `join_all`) the chance to queue up as well;
//! - whoever finds its own request still queued after yielding flushes the
//!   queue as a single `get_all`, newest requests first, at most
//!   `batch_size` keys per round trip;
//! - a full queue is flushed immediately, without yielding.
//!
//! Callers never orchestrate batches; they just await [`BulkQuery::get`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use arbor_types::ObjectHash;

use crate::cache::ObjectCache;
use crate::error::{StoreError, StoreResult};
use crate::object::StoredObject;
use crate::traits::{ObjectLoader, ObjectStore};

/// Tuning of the bulk query engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkQueryConfig {
    /// Maximum number of keys per backend round trip.
    pub batch_size: usize,
    /// Capacity of the LRU object cache (0 disables caching).
    pub cache_size: usize,
}

impl Default for BulkQueryConfig {
    fn default() -> Self {
        Self {
            batch_size: 5_000,
            cache_size: 100_000,
        }
    }
}

/// Counters describing how well lookups were batched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BulkQueryStats {
    /// Calls to [`BulkQuery::get`].
    pub requests: u64,
    /// Requests answered from the cache.
    pub cache_hits: u64,
    /// Backend round trips.
    pub batches: u64,
    /// Objects received from the backend.
    pub fetched: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    batches: AtomicU64,
    fetched: AtomicU64,
}

/// Outcome delivered to every waiter of a hash.
#[derive(Clone, Debug)]
enum Fetched {
    Found(StoredObject),
    Missing,
    Mismatch(ObjectHash),
    Failed(String),
}

type Waiter = oneshot::Sender<Fetched>;

#[derive(Default)]
struct Pending {
    /// Queued hashes; the newest request is at the end.
    queue: Vec<ObjectHash>,
    queued: HashSet<ObjectHash>,
    /// Waiters of every queued or in-flight hash.
    waiters: HashMap<ObjectHash, Vec<Waiter>>,
}

/// Batching, caching, deduplicating front of an [`ObjectStore`].
pub struct BulkQuery {
    backend: Arc<dyn ObjectStore>,
    cache: ObjectCache,
    pending: Mutex<Pending>,
    batch_size: usize,
    counters: Counters,
}

impl BulkQuery {
    pub fn new(backend: Arc<dyn ObjectStore>, config: &BulkQueryConfig) -> Self {
        Self {
            backend,
            cache: ObjectCache::new(config.cache_size),
            pending: Mutex::new(Pending::default()),
            batch_size: config.batch_size.max(1),
            counters: Counters::default(),
        }
    }

    /// The backend this engine fronts.
    pub fn backend(&self) -> &Arc<dyn ObjectStore> {
        &self.backend
    }

    /// Resolve one hash, batching with every other outstanding lookup.
    pub async fn get(&self, hash: &ObjectHash) -> StoreResult<StoredObject> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        if let Some(obj) = self.cache.get(hash) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(obj);
        }

        loop {
            let (rx, queue_full) = self.enqueue(*hash);
            if !queue_full {
                tokio::task::yield_now().await;
            }
            while self.is_queued(hash) {
                self.flush().await;
            }
            match rx.await {
                Ok(Fetched::Found(obj)) => return Ok(obj),
                Ok(Fetched::Missing) => return Err(StoreError::NotFound(*hash)),
                Ok(Fetched::Mismatch(computed)) => {
                    return Err(StoreError::HashMismatch {
                        expected: *hash,
                        computed,
                    })
                }
                Ok(Fetched::Failed(reason)) => return Err(StoreError::Backend(reason)),
                // The flush carrying this hash was cancelled; ask again.
                Err(_) => debug!(hash = %hash.short_hex(), "fetch abandoned, re-queueing"),
            }
        }
    }

    /// Resolve many hashes; they travel in as few batches as possible.
    pub async fn get_all(&self, hashes: &[ObjectHash]) -> StoreResult<Vec<StoredObject>> {
        try_join_all(hashes.iter().map(|hash| self.get(hash))).await
    }

    /// Answer from the cache only.
    pub fn get_if_cached(&self, hash: &ObjectHash) -> Option<StoredObject> {
        self.cache.get(hash)
    }

    /// Write objects through the cache to the backend.
    pub async fn put_all(&self, objects: Vec<StoredObject>) -> StoreResult<()> {
        if objects.is_empty() {
            return Ok(());
        }
        for obj in &objects {
            self.cache.put(obj.compute_hash(), obj.clone());
        }
        debug!(count = objects.len(), "writing objects through bulk query");
        self.backend.put_all(objects).await
    }

    pub fn stats(&self) -> BulkQueryStats {
        BulkQueryStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            fetched: self.counters.fetched.load(Ordering::Relaxed),
        }
    }

    /// Number of hashes waiting for a flush.
    pub fn queued_len(&self) -> usize {
        self.pending.lock().expect("lock poisoned").queue.len()
    }

    // ---------------------------------------------------------------
    // Queue management
    // ---------------------------------------------------------------

    fn enqueue(&self, hash: ObjectHash) -> (oneshot::Receiver<Fetched>, bool) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("lock poisoned");
        let waiters = pending.waiters.entry(hash).or_default();
        let first = waiters.is_empty();
        waiters.push(tx);
        if first {
            pending.queue.push(hash);
            pending.queued.insert(hash);
        }
        let full = pending.queue.len() >= self.batch_size;
        (rx, full)
    }

    fn is_queued(&self, hash: &ObjectHash) -> bool {
        self.pending
            .lock()
            .expect("lock poisoned")
            .queued
            .contains(hash)
    }

    async fn flush(&self) {
        let batch: Vec<ObjectHash> = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            let take = pending.queue.len().min(self.batch_size);
            let start = pending.queue.len() - take;
            let batch: Vec<ObjectHash> = pending.queue.drain(start..).rev().collect();
            for hash in &batch {
                pending.queued.remove(hash);
            }
            batch
        };
        if batch.is_empty() {
            return;
        }

        let mut in_flight = InFlight {
            pending: &self.pending,
            keys: batch,
            settled: false,
        };
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        debug!(keys = in_flight.keys.len(), "flushing bulk query batch");

        let result = self.backend.get_all(&in_flight.keys).await;
        self.settle(&in_flight.keys, result);
        in_flight.settled = true;
    }

    fn settle(
        &self,
        keys: &[ObjectHash],
        result: StoreResult<HashMap<ObjectHash, Option<StoredObject>>>,
    ) {
        let mut found = match result {
            Ok(found) => found,
            Err(e) => {
                warn!(keys = keys.len(), error = %e, "bulk fetch failed");
                let reason = e.to_string();
                for key in keys {
                    self.resolve(key, Fetched::Failed(reason.clone()));
                }
                return;
            }
        };
        for key in keys {
            let outcome = match found.remove(key).flatten() {
                Some(obj) => {
                    let computed = obj.compute_hash();
                    if computed == *key {
                        self.counters.fetched.fetch_add(1, Ordering::Relaxed);
                        self.cache.put(*key, obj.clone());
                        Fetched::Found(obj)
                    } else {
                        Fetched::Mismatch(computed)
                    }
                }
                None => Fetched::Missing,
            };
            self.resolve(key, outcome);
        }
    }

    fn resolve(&self, key: &ObjectHash, outcome: Fetched) {
        let waiters = self
            .pending
            .lock()
            .expect("lock poisoned")
            .waiters
            .remove(key)
            .unwrap_or_default();
        for waiter in waiters {
            // A dropped receiver only means its requester went away.
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Releases the waiters of a batch whose flush was dropped mid-flight, so
/// they re-queue instead of waiting forever.
struct InFlight<'a> {
    pending: &'a Mutex<Pending>,
    keys: Vec<ObjectHash>,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Ok(mut pending) = self.pending.lock() {
            for key in &self.keys {
                pending.waiters.remove(key);
            }
        }
    }
}

#[async_trait]
impl ObjectLoader for BulkQuery {
    async fn load(&self, hash: &ObjectHash) -> StoreResult<StoredObject> {
        self.get(hash).await
    }
}

impl std::fmt::Debug for BulkQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkQuery")
            .field("batch_size", &self.batch_size)
            .field("cached", &self.cache.len())
            .field("stats", &self.stats())
            .finish()
    }
}
