use thiserror::Error;

/// Errors produced when parsing or validating foundation types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid repository id {id:?}: {reason}")]
    InvalidRepositoryId { id: String, reason: String },

    #[error("invalid node reference: {0}")]
    InvalidReference(String),
}
