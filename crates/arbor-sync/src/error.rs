use thiserror::Error;

/// Errors raised while synchronizing a model.
///
/// Unknown concepts, roles and unresolvable references are not errors; they
/// are counted in the [`SyncReport`](crate::SyncReport).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid invalidation path: {0}")]
    InvalidPath(String),

    #[error("malformed model specification: {0}")]
    Spec(#[from] serde_json::Error),

    #[error("tree error: {0}")]
    Tree(#[from] arbor_tree::TreeError),

    #[error("store error: {0}")]
    Store(#[from] arbor_store::StoreError),

    #[error("diff error: {0}")]
    Diff(#[from] arbor_diff::DiffError),
}

pub type SyncResult<T> = Result<T, SyncError>;
