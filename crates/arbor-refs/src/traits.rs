//! The [`BranchStore`] trait defining branch head storage.

use async_trait::async_trait;
use tokio::sync::watch;

use arbor_types::{ObjectHash, RepositoryId};

use crate::error::Result;
use crate::types::BranchRef;

/// Storage backend for branch heads.
///
/// A head is the hash of the latest version of a branch. Heads are only
/// changed by compare-and-swap, so concurrent writers detect each other and
/// can merge instead of overwriting. Implementations must be thread-safe.
#[async_trait]
pub trait BranchStore: Send + Sync {
    /// The current head of `branch`, or `None` if the branch does not exist.
    async fn head(&self, branch: &BranchRef) -> Result<Option<ObjectHash>>;

    /// Set the head of `branch` to `new` if it currently is `expected`.
    ///
    /// `expected == None` creates the branch. Returns whether the head was
    /// updated; a `false` result leaves the store unchanged.
    async fn compare_and_swap(
        &self,
        branch: &BranchRef,
        expected: Option<ObjectHash>,
        new: ObjectHash,
    ) -> Result<bool>;

    /// Delete `branch`. Returns whether it existed.
    async fn delete(&self, branch: &BranchRef) -> Result<bool>;

    /// All branches of `repository`, sorted by name.
    async fn branches(&self, repository: &RepositoryId) -> Result<Vec<BranchRef>>;

    /// A receiver that observes every head change of `branch`.
    async fn watch(&self, branch: &BranchRef) -> Result<watch::Receiver<Option<ObjectHash>>>;
}
