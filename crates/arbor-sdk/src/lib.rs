//! High-level SDK for Arbor.
//!
//! Ties the object store, trees, versions, merging, synchronization and
//! branch heads together behind a [`Repository`] and its [`Branch`]
//! handles.
//!
//! ```no_run
//! use arbor_sdk::{NodeSpec, Repository, RepositoryConfig};
//!
//! # async fn example() -> arbor_sdk::SdkResult<()> {
//! let repo = Repository::in_memory("models", RepositoryConfig::default())?;
//! let master = repo.init().await?;
//! let spec = NodeSpec::from_json(r#"{ "id": "model" }"#)?;
//! let (head, report) = master.import(&spec).await?;
//! println!("{} changes, head {}", report.changes(), head.hash());
//! # Ok(())
//! # }
//! ```

pub mod branch;
pub mod config;
pub mod error;
pub mod protocol;
pub mod repository;

pub use branch::{Branch, BranchWrite};
pub use config::RepositoryConfig;
pub use error::{SdkError, SdkResult};
pub use protocol::{BranchHeadProtocol, LocalHeadService};
pub use repository::Repository;

// Re-export commonly used types from the layers below.
pub use arbor_refs::{BranchRef, BranchStore, InMemoryBranchStore};
pub use arbor_store::{InMemoryObjectStore, ObjectStore};
pub use arbor_sync::{DeclaredSchema, InvalidationTree, NodeSpec, OpenSchema, SyncReport};
pub use arbor_tree::{Tree, WriteTransaction};
pub use arbor_types::{ConceptRef, IdGenerator, NodeId, NodeReference, ObjectHash, RepositoryId};
pub use arbor_version::Version;
