//! Model synchronization for Arbor.
//!
//! Brings a live tree into the state described by a source: a JSON
//! [`NodeSpec`] or another stored [`Tree`](arbor_tree::Tree). Nodes are
//! matched by stable external ids, and the resulting edits are minimal, so
//! re-importing an unchanged model emits nothing and concurrent edits of
//! untouched nodes merge cleanly.
//!
//! # Key Types
//!
//! - [`ModelSynchronizer`] -- the synchronization walk, producing a [`SyncReport`]
//! - [`SyncSource`] -- [`SpecSource`] for specifications, [`TreeSource`] for trees
//! - [`InvalidationTree`] -- which source nodes changed since the last sync
//! - [`Schema`] -- concept and role metadata ([`OpenSchema`], [`DeclaredSchema`])

pub mod error;
pub mod invalidation;
pub mod schema;
pub mod source;
pub mod spec;
pub mod synchronizer;

pub use error::{SyncError, SyncResult};
pub use invalidation::{invalidate_changes, AllNodes, InvalidationTree, SyncFilter, DEFAULT_INVALIDATION_LIMIT};
pub use schema::{ConceptDeclaration, DeclaredSchema, OpenSchema, RoleOrdering, Schema};
pub use source::{SourceNode, SpecSource, SyncSource, TreeSource};
pub use spec::{original_id, ModelSpec, NodeSpec, ORIGINAL_ID_PROPERTY};
pub use synchronizer::{ModelSynchronizer, SyncProgress, SyncProgressCallback, SyncReport};
