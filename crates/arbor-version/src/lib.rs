//! Versions for Arbor.
//!
//! A version records a tree, the version(s) it derives from and the
//! operations that produced it. Versions form a DAG; merge versions join
//! two lines of history over their common base.
//!
//! # Key Types
//!
//! - [`Version`] / [`VersionData`] -- written, immutable versions
//! - [`VersionBuilder`] -- initial, regular, merge, undo and revert versions
//! - [`OperationLog`] -- inline or out-of-line operation storage
//!
//! Lineage queries ([`common_base`], [`linear_history`], [`history`],
//! [`is_ancestor`]) live in [`lineage`].

pub mod builder;
pub mod compress;
pub mod error;
pub mod lineage;
pub mod version;

pub use builder::VersionBuilder;
pub use compress::{compress_operations, expand_bulk_add, expand_operations};
pub use error::{VersionError, VersionResult};
pub use lineage::{common_base, history, is_ancestor, linear_history};
pub use version::{OperationList, OperationLog, Version, VersionData, INLINE_OPERATIONS_LIMIT};
