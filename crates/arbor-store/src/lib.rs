//! Content-addressed object storage for Arbor.
//!
//! Every record Arbor persists -- node records, hash-trie nodes, trees,
//! versions, operation lists -- is an immutable [`StoredObject`] identified by
//! its domain-separated BLAKE3 hash.
//!
//! # Layers
//!
//! - [`ObjectStore`] -- async backend contract (`get_all` / `put_all`)
//! - [`InMemoryObjectStore`] -- `HashMap` backend for tests and embedding
//! - [`ChunkedStore`] -- splits arbitrarily large key sets into bounded requests
//! - [`BulkQuery`] -- coalesces point lookups into batched, cached fetches
//! - [`WriteBuffer`] -- staging overlay for records a transaction has not committed
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written; the hash is the only identity.
//! 2. Cached entries never go stale, they are only evicted for space.
//! 3. Concurrent reads are always safe.
//! 4. A missing entry is a typed [`StoreError::NotFound`], never a silent `None`
//!    above the backend layer.

pub mod buffer;
pub mod bulk;
pub mod cache;
pub mod chunked;
pub mod error;
pub mod memory;
pub mod object;
pub mod traits;

pub use buffer::WriteBuffer;
pub use bulk::{BulkQuery, BulkQueryConfig, BulkQueryStats};
pub use cache::ObjectCache;
pub use chunked::ChunkedStore;
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryObjectStore;
pub use object::{decode_batch, encode_batch, ObjectKind, Record, StoredObject};
pub use traits::{ObjectLoader, ObjectStore};
