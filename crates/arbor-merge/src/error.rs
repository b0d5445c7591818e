//! Error types for merging.

use arbor_types::ObjectHash;

/// Errors that can occur while merging, undoing or reverting versions.
///
/// Conflicts are not errors: a conflicting operation is recorded as a
/// `NoOp` in the merge version.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// The versions belong to different repositories.
    #[error("cannot merge versions of {left} and {right}")]
    RepositoryMismatch { left: String, right: String },

    /// A revert target is not part of the history it should roll back.
    #[error("{version} is not an ancestor of {head}")]
    NotAncestor { version: ObjectHash, head: ObjectHash },

    /// Reading or writing a version failed.
    #[error("version error: {0}")]
    Version(#[from] arbor_version::VersionError),

    /// Replaying an operation failed.
    #[error("tree error: {0}")]
    Tree(#[from] arbor_tree::TreeError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] arbor_store::StoreError),
}

/// Convenience alias for merge results.
pub type MergeResult<T> = Result<T, MergeError>;
