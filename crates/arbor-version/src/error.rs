//! Error types for versions.

use arbor_types::ObjectHash;

/// Errors that can occur while building or reading versions.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// No version is stored under this hash.
    #[error("version not found: {0}")]
    VersionNotFound(ObjectHash),

    /// A version was combined with one of another repository.
    #[error("repository mismatch: {expected} vs {actual}")]
    RepositoryMismatch { expected: String, actual: String },

    /// A version record is inconsistent (e.g. operations without a base).
    #[error("invalid version {id}: {reason}")]
    Invalid { id: ObjectHash, reason: String },

    /// Reading or writing a tree failed.
    #[error("tree error: {0}")]
    Tree(#[from] arbor_tree::TreeError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] arbor_store::StoreError),
}

/// Convenience alias for version results.
pub type VersionResult<T> = Result<T, VersionError>;
