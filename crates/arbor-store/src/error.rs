use arbor_types::ObjectHash;

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A referenced hash could not be resolved.
    #[error("entry not found: {0}")]
    NotFound(ObjectHash),

    /// The backend returned data that does not hash to the requested key.
    #[error("hash mismatch: requested {expected}, received {computed}")]
    HashMismatch {
        expected: ObjectHash,
        computed: ObjectHash,
    },

    /// Serialization failure while encoding a record.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The object data is malformed or of the wrong kind.
    #[error("corrupt object {id}: {reason}")]
    CorruptObject { id: ObjectHash, reason: String },

    /// A wire blob carried a kind tag this build does not know.
    #[error("unknown object kind tag: {0:#04x}")]
    UnknownKind(u8),

    /// The backing store failed (network, remote error, ...).
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
