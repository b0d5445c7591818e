//! Diff engine for Arbor trees.
//!
//! Compares two snapshots of the same repository and reports node-level
//! changes. Unchanged subtrees of the node index are skipped by hash, so
//! the cost is proportional to the size of the change, not of the trees.
//!
//! # Key Types
//!
//! - [`TreeDiff`] / [`TreeChange`] -- node-level changes between two trees
//! - [`MapDiff`] / [`MapChange`] -- keyed changes of a property or reference map

pub mod error;
pub mod map_diff;
pub mod tree_diff;

pub use error::{DiffError, DiffResult};
pub use map_diff::{diff_maps, MapChange, MapDiff};
pub use tree_diff::{diff_trees, TreeChange, TreeDiff};
