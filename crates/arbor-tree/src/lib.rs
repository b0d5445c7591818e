//! Persistent, content-addressed trees for Arbor.
//!
//! A tree maps node ids to immutable [`NodeData`] records through a hash
//! trie. Snapshots ([`Tree`]) are read-only and cheap to share; edits go
//! through a [`WriteTransaction`], which rewrites only the touched trie
//! paths and records every edit as an [`Operation`].
//!
//! # Invariants
//!
//! - Every tree contains the root node [`NodeId::ROOT`](arbor_types::NodeId::ROOT).
//! - Structurally equal trees have equal hashes.
//! - A node is never contained in itself or one of its descendants.

pub mod error;
pub mod node;
pub mod operation;
pub mod transaction;
pub mod tree;
pub mod trie;

pub use error::{TreeError, TreeResult};
pub use node::NodeData;
pub use operation::{subtree_operations, Operation};
pub use transaction::WriteTransaction;
pub use tree::{Tree, TreeData, DETACHED_ROLE};
pub use trie::{TrieChange, TrieNode};
