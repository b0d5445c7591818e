//! Branch management for Arbor.
//!
//! A branch is a named, mutable pointer to the latest version of a
//! repository. Branch heads live in a [`BranchStore`] and are only updated
//! by compare-and-swap: a writer that loses the race reloads the head,
//! merges, and tries again.
//!
//! # Modules
//!
//! - [`error`] -- Error types for branch operations
//! - [`types`] -- [`BranchRef`], the name of a branch
//! - [`traits`] -- The [`BranchStore`] trait
//! - [`names`] -- Branch name validation
//! - [`memory`] -- In-memory [`InMemoryBranchStore`]

pub mod error;
pub mod memory;
pub mod names;
pub mod traits;
pub mod types;

pub use error::{RefError, Result};
pub use memory::InMemoryBranchStore;
pub use names::{validate_branch_name, DEFAULT_BRANCH};
pub use traits::BranchStore;
pub use types::BranchRef;
