//! Foundation types for Arbor.
//!
//! This crate provides the identity and reference types shared by every
//! other Arbor crate. It has no knowledge of storage or trees.
//!
//! # Key Types
//!
//! - [`ObjectHash`] -- Content-addressed identifier (BLAKE3 hash)
//! - [`NodeId`] -- 64-bit node identity, supplied by an [`IdGenerator`]
//! - [`RepositoryId`] -- Identity of a repository (a family of versions)
//! - [`ConceptRef`] -- Opaque node type tag
//! - [`NodeReference`] -- Target of a reference role, local or foreign

pub mod error;
pub mod hash;
pub mod id;
pub mod node;
pub mod repository;

pub use error::TypeError;
pub use hash::ObjectHash;
pub use id::{ClientIdGenerator, IdGenerator};
pub use node::{ConceptRef, NodeId, NodeReference};
pub use repository::RepositoryId;
