use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("type error: {0}")]
    Type(#[from] arbor_types::TypeError),

    #[error("store error: {0}")]
    Store(#[from] arbor_store::StoreError),

    #[error("tree error: {0}")]
    Tree(#[from] arbor_tree::TreeError),

    #[error("version error: {0}")]
    Version(#[from] arbor_version::VersionError),

    #[error("merge error: {0}")]
    Merge(#[from] arbor_merge::MergeError),

    #[error("sync error: {0}")]
    Sync(#[from] arbor_sync::SyncError),

    #[error("ref error: {0}")]
    Ref(#[from] arbor_refs::RefError),
}

pub type SdkResult<T> = Result<T, SdkError>;
