//! Error types for the diff crate.

/// Errors that can occur while diffing trees.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// Trees of different repositories cannot be compared node by node.
    #[error("cannot diff trees of repositories {old} and {new}")]
    RepositoryMismatch { old: String, new: String },

    /// Reading a tree failed.
    #[error("tree error: {0}")]
    Tree(#[from] arbor_tree::TreeError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] arbor_store::StoreError),
}

/// Convenience alias for diff results.
pub type DiffResult<T> = Result<T, DiffError>;
