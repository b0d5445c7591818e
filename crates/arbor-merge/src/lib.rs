//! Merge engine for Arbor.
//!
//! Implements three-way merge of concurrently edited versions by replaying
//! operations with captured intent, plus undo and revert on top of a head.
//!
//! # Key Types
//!
//! - [`VersionMerger`] -- merge, undo and revert
//! - [`Intent`] -- an operation with the sibling context it was applied in
//!
//! # Conflict policy
//!
//! Deletes win over edits, the later of two moves wins, nodes whose parent
//! is gone end up under the root in the `detached` role, and moves that
//! would create a cycle are dropped. Every dropped operation is recorded as
//! `NoOp` in the merge version.

pub mod cancel;
pub mod error;
pub mod intent;
pub mod inverse;
pub mod merger;

pub use cancel::drop_cancelled;
pub use error::{MergeError, MergeResult};
pub use intent::{Intent, Neighbours};
pub use inverse::{base_tree, inverse_operations, replayable_operations};
pub use merger::VersionMerger;
