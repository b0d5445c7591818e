//! Error types for branch operations.

use thiserror::Error;

/// Errors that can occur during branch operations.
#[derive(Debug, Error)]
pub enum RefError {
    /// The branch name is invalid.
    #[error("invalid branch name: {name}: {reason}")]
    InvalidBranchName { name: String, reason: String },

    /// A lock protecting the branch table was poisoned.
    #[error("branch store lock poisoned: {0}")]
    Poisoned(String),

    /// Backend failure of a remote branch store.
    #[error("branch store backend error: {0}")]
    Backend(String),
}

/// Convenience type alias for branch operations.
pub type Result<T> = std::result::Result<T, RefError>;
