//! Error types for trees and write transactions.

use arbor_store::StoreError;
use arbor_types::NodeId;

/// Errors that can occur while reading or mutating a tree.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// The node does not exist in the tree.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A node with this id already exists.
    #[error("node already exists: {0}")]
    NodeAlreadyExists(NodeId),

    /// The move would place a node under itself or one of its descendants.
    #[error("containment cycle: cannot move {node} under {new_parent}")]
    ContainmentCycle {
        /// The node being moved.
        node: NodeId,
        /// The requested new parent.
        new_parent: NodeId,
    },

    /// The root node can be neither deleted nor moved.
    #[error("the root node cannot be removed or moved")]
    RootNotRemovable,

    /// A single-node delete was applied to a node that still has children.
    #[error("node {0} still has children")]
    NotEmpty(NodeId),

    /// The tree data is structurally inconsistent.
    #[error("corrupt tree: {0}")]
    Corrupt(String),

    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience alias for tree results.
pub type TreeResult<T> = Result<T, TreeError>;
