use arbor_types::ObjectHash;

/// Domain-separated BLAKE3 content hasher.
///
/// The domain tag (e.g. `"arbor-node-v1"`) is prepended to every hash
/// computation, followed by a `:` separator and the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Node records.
    pub const NODE: Self = Self::new("arbor-node-v1");
    /// Hash-trie nodes.
    pub const TRIE: Self = Self::new("arbor-trie-v1");
    /// Tree records (repository + trie root).
    pub const TREE: Self = Self::new("arbor-tree-v1");
    /// Version records.
    pub const VERSION: Self = Self::new("arbor-version-v1");
    /// Out-of-line operation lists.
    pub const OPERATIONS: Self = Self::new("arbor-ops-v1");

    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> ObjectHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        ObjectHash::from_digest(*hasher.finalize().as_bytes())
    }

    /// Hash the canonical JSON form of a value.
    ///
    /// Canonical means field order follows the declaration order and maps
    /// are ordered (`BTreeMap`); callers are responsible for the latter.
    pub fn hash_json<T: serde::Serialize>(&self, value: &T) -> Result<ObjectHash, HasherError> {
        let data =
            serde_json::to_vec(value).map_err(|e| HasherError::Serialization(e.to_string()))?;
        Ok(self.hash(&data))
    }

    /// Check that `data` hashes to `expected` under this domain.
    pub fn verify(&self, data: &[u8], expected: &ObjectHash) -> bool {
        self.hash(data) == *expected
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }
}

/// Errors from hashing operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HasherError {
    #[error("serialization error: {0}")]
    Serialization(String),
}
