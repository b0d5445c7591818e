//! Branch-head protocol.
//!
//! Clients exchange versions through the head of a branch: they pull the
//! current head, push versions they created, and long-poll for heads written
//! by others. [`LocalHeadService`] serves the protocol from a
//! [`BranchStore`] in the same process. A push never overwrites a head it
//! has not seen: when the head moved, the pushed version is merged with it
//! and the merge becomes the new head.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use arbor_merge::VersionMerger;
use arbor_refs::{BranchRef, BranchStore};
use arbor_store::{BulkQuery, ObjectLoader};
use arbor_types::ObjectHash;
use arbor_version::Version;

use crate::error::SdkResult;

#[async_trait]
pub trait BranchHeadProtocol: Send + Sync {
    /// The current head of `branch`, `None` if the branch does not exist.
    ///
    /// `last_known` is the head the caller already has; objects it
    /// references need not be transferred again.
    async fn pull(&self, branch: &BranchRef, last_known: Option<ObjectHash>) -> SdkResult<Option<ObjectHash>>;

    /// Make the stored version `version` part of `branch` and return the
    /// resulting head.
    ///
    /// `base` is the head `version` was created on. While it is still the
    /// head, the branch advances to `version` without a merge.
    async fn push(&self, branch: &BranchRef, version: &ObjectHash, base: Option<ObjectHash>) -> SdkResult<ObjectHash>;

    /// Wait until the head of `branch` differs from `last_known` and return
    /// it. Returns `last_known` unchanged when the poll timeout expires.
    async fn poll(&self, branch: &BranchRef, last_known: Option<ObjectHash>) -> SdkResult<Option<ObjectHash>>;
}

/// Serves [`BranchHeadProtocol`] from a [`BranchStore`].
pub struct LocalHeadService {
    store: Arc<BulkQuery>,
    branches: Arc<dyn BranchStore>,
    merger: VersionMerger,
    poll_timeout: Duration,
}

impl LocalHeadService {
    pub fn new(store: Arc<BulkQuery>, branches: Arc<dyn BranchStore>, merger: VersionMerger) -> Self {
        Self {
            store,
            branches,
            merger,
            poll_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn branches(&self) -> &Arc<dyn BranchStore> {
        &self.branches
    }

    pub fn merger(&self) -> &VersionMerger {
        &self.merger
    }

    pub async fn load(&self, hash: &ObjectHash) -> SdkResult<Version> {
        let loader: Arc<dyn ObjectLoader> = self.store.clone();
        Ok(Version::load(loader, hash).await?)
    }

    /// The head version of `branch`, if any.
    pub async fn head(&self, branch: &BranchRef) -> SdkResult<Option<Version>> {
        match self.branches.head(branch).await? {
            Some(hash) => Ok(Some(self.load(&hash).await?)),
            None => Ok(None),
        }
    }

    /// Advance `branch` to include `version`.
    ///
    /// Creates the branch if it does not exist. Retries until the
    /// compare-and-swap succeeds, merging with whatever head it finds.
    pub async fn push_version(&self, branch: &BranchRef, version: &Version) -> SdkResult<Version> {
        loop {
            let current = self.branches.head(branch).await?;
            let next = match current {
                None => version.clone(),
                Some(hash) if hash == version.hash() => return Ok(version.clone()),
                Some(hash) => {
                    let head = self.load(&hash).await?;
                    self.merger.merge(&head, version).await?
                }
            };
            if Some(next.hash()) == current {
                debug!(%branch, version = %version.hash().short_hex(), "head already contains version");
                return Ok(next);
            }
            if self.branches.compare_and_swap(branch, current, next.hash()).await? {
                info!(
                    %branch,
                    previous = ?current.map(|h| h.short_hex()),
                    head = %next.hash().short_hex(),
                    "updated branch head"
                );
                return Ok(next);
            }
            debug!(%branch, "head moved during push, merging again");
        }
    }

    /// Like [`push_version`](Self::push_version), for a version created on
    /// top of `base`.
    pub async fn push_on(&self, branch: &BranchRef, version: &Version, base: Option<ObjectHash>) -> SdkResult<Version> {
        if let Some(base) = base {
            if version.parents().contains(&base)
                && self.branches.compare_and_swap(branch, Some(base), version.hash()).await?
            {
                info!(
                    %branch,
                    previous = %base.short_hex(),
                    head = %version.hash().short_hex(),
                    "fast-forwarded branch head"
                );
                return Ok(version.clone());
            }
        }
        self.push_version(branch, version).await
    }
}

#[async_trait]
impl BranchHeadProtocol for LocalHeadService {
    async fn pull(&self, branch: &BranchRef, last_known: Option<ObjectHash>) -> SdkResult<Option<ObjectHash>> {
        let head = self.branches.head(branch).await?;
        if head.is_some() && head == last_known {
            debug!(%branch, "pull: head unchanged");
        }
        Ok(head)
    }

    async fn push(&self, branch: &BranchRef, version: &ObjectHash, base: Option<ObjectHash>) -> SdkResult<ObjectHash> {
        let version = self.load(version).await?;
        Ok(self.push_on(branch, &version, base).await?.hash())
    }

    async fn poll(&self, branch: &BranchRef, last_known: Option<ObjectHash>) -> SdkResult<Option<ObjectHash>> {
        let mut rx = self.branches.watch(branch).await?;
        let current = *rx.borrow_and_update();
        if current != last_known {
            return Ok(current);
        }
        match tokio::time::timeout(self.poll_timeout, rx.changed()).await {
            Ok(Ok(())) => Ok(*rx.borrow_and_update()),
            // The branch store dropped the head cell.
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                debug!(%branch, "poll timed out");
                Ok(current)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use arbor_refs::InMemoryBranchStore;
    use arbor_store::{BulkQueryConfig, InMemoryObjectStore};
    use arbor_tree::{Tree, WriteTransaction};
    use arbor_types::{ClientIdGenerator, IdGenerator, NodeId, RepositoryId};
    use arbor_version::VersionBuilder;

    struct Fixture {
        store: Arc<BulkQuery>,
        ids: Arc<ClientIdGenerator>,
        service: LocalHeadService,
        branch: BranchRef,
        v0: Version,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(BulkQuery::new(
                Arc::new(InMemoryObjectStore::new()),
                &BulkQueryConfig::default(),
            ));
            let ids = Arc::new(ClientIdGenerator::new(3));
            let repository = RepositoryId::new("heads").unwrap();
            let merger = VersionMerger::new(store.clone(), ids.clone());
            let service = LocalHeadService::new(store.clone(), Arc::new(InMemoryBranchStore::new()), merger)
                .with_poll_timeout(Duration::from_millis(50));
            let empty = Tree::create_empty(repository.clone(), &store).await.unwrap();
            let v0 = VersionBuilder::new(ids.generate().as_u64())
                .initial(&empty, &store)
                .await
                .unwrap();
            Self {
                store,
                ids,
                service,
                branch: BranchRef::default_branch(repository),
                v0,
            }
        }

        /// A version on top of `base` that adds one child of the root.
        async fn add_child(&self, base: &Version, role: &str) -> (Version, NodeId) {
            let mut tx = WriteTransaction::new(&base.tree().await.unwrap(), self.store.clone());
            let id = self.ids.generate();
            tx.add_new_child(NodeId::ROOT, Some(role), None, id, None).await.unwrap();
            let (tree, ops) = tx.commit().await.unwrap();
            let version = VersionBuilder::new(self.ids.generate().as_u64())
                .regular(base, &tree, ops, &self.store)
                .await
                .unwrap();
            (version, id)
        }
    }

    // ---------------------------------------------------------------
    // Push
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn push_creates_then_fast_forwards() {
        let f = Fixture::new().await;
        assert_eq!(f.service.pull(&f.branch, None).await.unwrap(), None);

        assert_eq!(f.service.push(&f.branch, &f.v0.hash(), None).await.unwrap(), f.v0.hash());
        let (v1, _) = f.add_child(&f.v0, "items").await;
        assert_eq!(f.service.push(&f.branch, &v1.hash(), None).await.unwrap(), v1.hash());
        assert_eq!(f.service.pull(&f.branch, Some(f.v0.hash())).await.unwrap(), Some(v1.hash()));
        assert_eq!(f.service.pull(&f.branch, Some(v1.hash())).await.unwrap(), Some(v1.hash()));

        // Pushing an ancestor leaves the head alone.
        assert_eq!(f.service.push(&f.branch, &f.v0.hash(), None).await.unwrap(), v1.hash());
    }

    #[tokio::test]
    async fn divergent_push_is_merged() {
        let f = Fixture::new().await;
        f.service.push_version(&f.branch, &f.v0).await.unwrap();
        let (left, a) = f.add_child(&f.v0, "items").await;
        let (right, b) = f.add_child(&f.v0, "items").await;

        f.service.push_version(&f.branch, &left).await.unwrap();
        let head = f.service.push_version(&f.branch, &right).await.unwrap();

        assert!(head.is_merge());
        let tree = head.tree().await.unwrap();
        assert!(tree.contains(a).await.unwrap());
        assert!(tree.contains(b).await.unwrap());
        assert_eq!(f.service.pull(&f.branch, None).await.unwrap(), Some(head.hash()));
    }

    #[tokio::test]
    async fn push_on_current_base_fast_forwards() {
        let f = Fixture::new().await;
        f.service.push_version(&f.branch, &f.v0).await.unwrap();
        let (v1, _) = f.add_child(&f.v0, "items").await;

        let head = f.service.push(&f.branch, &v1.hash(), Some(f.v0.hash())).await.unwrap();
        assert_eq!(head, v1.hash());
        assert_eq!(f.service.pull(&f.branch, None).await.unwrap(), Some(v1.hash()));
    }

    #[tokio::test]
    async fn push_on_stale_base_is_merged() {
        let f = Fixture::new().await;
        f.service.push_version(&f.branch, &f.v0).await.unwrap();
        let (left, a) = f.add_child(&f.v0, "items").await;
        let (right, b) = f.add_child(&f.v0, "items").await;
        f.service.push(&f.branch, &left.hash(), Some(f.v0.hash())).await.unwrap();

        let head = f.service.push(&f.branch, &right.hash(), Some(f.v0.hash())).await.unwrap();
        let head = f.service.load(&head).await.unwrap();
        assert!(head.is_merge());
        let tree = head.tree().await.unwrap();
        assert!(tree.contains(a).await.unwrap() && tree.contains(b).await.unwrap());

        // A base the version was not built on is ignored.
        let (unrelated, _) = f.add_child(&f.v0, "other").await;
        let head = f.service.push(&f.branch, &unrelated.hash(), Some(head.hash())).await.unwrap();
        assert!(f.service.load(&head).await.unwrap().is_merge());
    }

    // ---------------------------------------------------------------
    // Poll
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn poll_returns_newer_head_immediately() {
        let f = Fixture::new().await;
        f.service.push_version(&f.branch, &f.v0).await.unwrap();
        assert_eq!(f.service.poll(&f.branch, None).await.unwrap(), Some(f.v0.hash()));
    }

    #[tokio::test]
    async fn poll_times_out_with_known_head() {
        let f = Fixture::new().await;
        f.service.push_version(&f.branch, &f.v0).await.unwrap();
        let polled = f.service.poll(&f.branch, Some(f.v0.hash())).await.unwrap();
        assert_eq!(polled, Some(f.v0.hash()));
    }

    #[tokio::test]
    async fn poll_wakes_on_push() {
        let f = Fixture::new().await;
        let service = LocalHeadService::new(
            f.store.clone(),
            f.service.branches().clone(),
            VersionMerger::new(f.store.clone(), f.ids.clone()),
        )
        .with_poll_timeout(Duration::from_secs(10));
        service.push_version(&f.branch, &f.v0).await.unwrap();
        let (v1, _) = f.add_child(&f.v0, "items").await;

        let (polled, pushed) = tokio::join!(service.poll(&f.branch, Some(f.v0.hash())), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            service.push_version(&f.branch, &v1).await
        });
        assert_eq!(pushed.unwrap(), v1);
        assert_eq!(polled.unwrap(), Some(v1.hash()));
    }
}
