//! Content hashing for Arbor.
//!
//! Every persisted record is identified by a domain-separated BLAKE3 digest
//! of its canonical serialization. The domain tag is derived from the record
//! kind, so a node record and a trie node with identical bytes never share a
//! hash.
//!
//! All hashing wraps `blake3`; there is no custom cryptography.

pub mod hasher;

pub use hasher::{ContentHasher, HasherError};
