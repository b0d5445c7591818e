use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use arbor_refs::BranchRef;
use arbor_store::BulkQuery;
use arbor_sync::{ModelSynchronizer, NodeSpec, OpenSchema, Schema, SpecSource, SyncFilter, SyncReport, SyncSource, TreeSource};
use arbor_tree::{Tree, WriteTransaction};
use arbor_types::{IdGenerator, NodeId, ObjectHash};
use arbor_version::{history, Version, VersionBuilder};

use crate::config::RepositoryConfig;
use crate::error::{SdkError, SdkResult};
use crate::protocol::{BranchHeadProtocol, LocalHeadService};

/// Handle on one branch of a repository.
///
/// Writes through handles of the same repository are serialized: only one
/// [`BranchWrite`] per branch is open at a time. Writes from other clients
/// are reconciled when the head is advanced.
#[derive(Clone)]
pub struct Branch {
    branch: BranchRef,
    store: Arc<BulkQuery>,
    ids: Arc<dyn IdGenerator>,
    heads: Arc<LocalHeadService>,
    config: RepositoryConfig,
    lock: Arc<Mutex<()>>,
}

impl Branch {
    pub(crate) fn new(
        branch: BranchRef,
        store: Arc<BulkQuery>,
        ids: Arc<dyn IdGenerator>,
        heads: Arc<LocalHeadService>,
        config: RepositoryConfig,
        lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            branch,
            store,
            ids,
            heads,
            config,
            lock,
        }
    }

    pub fn reference(&self) -> &BranchRef {
        &self.branch
    }

    pub fn name(&self) -> &str {
        self.branch.name()
    }

    // ---- Reads ----

    pub async fn head(&self) -> SdkResult<Version> {
        self.heads
            .head(&self.branch)
            .await?
            .ok_or_else(|| SdkError::BranchNotFound(self.branch.to_string()))
    }

    /// The tree of the head version.
    pub async fn tree(&self) -> SdkResult<Tree> {
        Ok(self.head().await?.tree().await?)
    }

    /// Up to `limit` versions, newest first, following base versions.
    pub async fn history(&self, limit: usize) -> SdkResult<Vec<Version>> {
        Ok(history(&self.head().await?, limit).await?)
    }

    /// Wait for a head other than `last_known`; see
    /// [`BranchHeadProtocol::poll`].
    pub async fn poll(&self, last_known: Option<ObjectHash>) -> SdkResult<Option<ObjectHash>> {
        self.heads.poll(&self.branch, last_known).await
    }

    // ---- Writes ----

    /// Open a write on the current head.
    ///
    /// Waits for any other write on this branch to finish. Dropping the
    /// returned [`BranchWrite`] discards its changes.
    pub async fn write(&self) -> SdkResult<BranchWrite<'_>> {
        let guard = self.lock.clone().lock_owned().await;
        let base = self.head().await?;
        let tx = WriteTransaction::new(&base.tree().await?, self.store.clone());
        debug!(branch = %self.branch, base = %base.hash().short_hex(), "opened write");
        Ok(BranchWrite {
            branch: self,
            _guard: guard,
            base,
            tx,
        })
    }

    /// Bring the branch to the state of `spec`, matching nodes by their
    /// original ids. The root of the specification is the branch root.
    pub async fn import(&self, spec: &NodeSpec) -> SdkResult<(Version, SyncReport)> {
        self.import_with_schema(spec, &OpenSchema).await
    }

    pub async fn import_with_schema(&self, spec: &NodeSpec, schema: &dyn Schema) -> SdkResult<(Version, SyncReport)> {
        let source = SpecSource::new(spec);
        let synchronizer = ModelSynchronizer::new(&source, &*self.ids).with_schema(schema);
        self.synchronize(&synchronizer).await
    }

    /// Mirror `source` into the branch, visiting only the nodes that pass
    /// `filter`.
    pub async fn synchronize_from(&self, source: &Tree, filter: &dyn SyncFilter) -> SdkResult<(Version, SyncReport)> {
        self.synchronize_from_with_schema(source, filter, &OpenSchema).await
    }

    pub async fn synchronize_from_with_schema(
        &self,
        source: &Tree,
        filter: &dyn SyncFilter,
        schema: &dyn Schema,
    ) -> SdkResult<(Version, SyncReport)> {
        let source = TreeSource::new(source.clone());
        let synchronizer = ModelSynchronizer::new(&source as &dyn SyncSource, &*self.ids)
            .with_filter(filter)
            .with_schema(schema);
        self.synchronize(&synchronizer).await
    }

    async fn synchronize(&self, synchronizer: &ModelSynchronizer<'_>) -> SdkResult<(Version, SyncReport)> {
        let mut write = self.write().await?;
        let report = synchronizer.synchronize(&mut write.tx, NodeId::ROOT).await?;
        let version = write.commit().await?;
        Ok((version, report))
    }

    /// Cancel the changes of `undone` on top of the current head.
    pub async fn undo(&self, undone: &Version) -> SdkResult<Version> {
        let _guard = self.lock.lock().await;
        let head = self.head().await?;
        let version = self.heads.merger().undo(&head, undone).await?;
        self.heads.push_on(&self.branch, &version, Some(head.hash())).await
    }

    /// Restore the tree of `target`, recorded as a new version on top of
    /// the current head.
    pub async fn revert_to(&self, target: &Version) -> SdkResult<Version> {
        let _guard = self.lock.lock().await;
        let head = self.head().await?;
        let version = self.heads.merger().revert(&head, target).await?;
        self.heads.push_on(&self.branch, &version, Some(head.hash())).await
    }

    /// Merge the head of `other` into this branch.
    pub async fn merge_from(&self, other: &Branch) -> SdkResult<Version> {
        if other.branch == self.branch {
            return Err(SdkError::InvalidOperation(format!("cannot merge {} into itself", self.branch)));
        }
        let _guard = self.lock.lock().await;
        let theirs = other.head().await?;
        let head = self.heads.push_version(&self.branch, &theirs).await?;
        info!(branch = %self.branch, from = %other.branch, head = %head.hash().short_hex(), "merged branch");
        Ok(head)
    }

    fn builder(&self) -> VersionBuilder {
        let builder =
            VersionBuilder::new(self.ids.generate().as_u64()).inline_limit(self.config.inline_operations_limit);
        match &self.config.author {
            Some(author) => builder.author(author.clone()),
            None => builder,
        }
    }
}

/// An open write on a [`Branch`].
///
/// Dereferences to the underlying [`WriteTransaction`]. Nothing becomes
/// visible until [`commit`](Self::commit).
pub struct BranchWrite<'a> {
    branch: &'a Branch,
    _guard: OwnedMutexGuard<()>,
    base: Version,
    tx: WriteTransaction,
}

impl BranchWrite<'_> {
    /// The head the write started from.
    pub fn base(&self) -> &Version {
        &self.base
    }

    /// Generator for ids of new nodes.
    pub fn ids(&self) -> &dyn IdGenerator {
        &*self.branch.ids
    }

    /// Write a version of the changes and make it part of the branch.
    ///
    /// Returns the new head: the written version, or its merge with
    /// versions committed concurrently by other clients. A write without
    /// changes returns its base.
    pub async fn commit(self) -> SdkResult<Version> {
        let BranchWrite {
            branch,
            _guard,
            base,
            tx,
        } = self;
        if !tx.is_modified() {
            debug!(branch = %branch.branch, "nothing to commit");
            return Ok(base);
        }
        let (tree, ops) = tx.commit().await?;
        let count = ops.len();
        let version = branch.builder().regular(&base, &tree, ops, &branch.store).await?;
        debug!(
            branch = %branch.branch,
            version = %version.hash().short_hex(),
            operations = count,
            "committed version"
        );
        branch.heads.push_on(&branch.branch, &version, Some(base.hash())).await
    }
}

impl Deref for BranchWrite<'_> {
    type Target = WriteTransaction;

    fn deref(&self) -> &WriteTransaction {
        &self.tx
    }
}

impl DerefMut for BranchWrite<'_> {
    fn deref_mut(&mut self) -> &mut WriteTransaction {
        &mut self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use arbor_refs::InMemoryBranchStore;
    use arbor_store::InMemoryObjectStore;
    use arbor_sync::{invalidate_changes, AllNodes, DeclaredSchema};
    use arbor_types::RepositoryId;

    use crate::repository::Repository;

    const MODEL: &str = r##"{
        "id": "model",
        "children": [
            {
                "id": "s1", "role": "states", "concept": "fsm.State",
                "properties": { "name": "Idle" }
            },
            {
                "id": "s2", "role": "states", "concept": "fsm.State",
                "properties": { "name": "Running" },
                "references": { "next": "s1" }
            }
        ]
    }"##;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn config(client: u32) -> RepositoryConfig {
        RepositoryConfig {
            client_id: Some(client),
            author: Some(format!("client-{client}")),
            ..RepositoryConfig::default()
        }
    }

    async fn master() -> (Repository, Branch) {
        init_tracing();
        let repo = Repository::in_memory("models", config(1)).unwrap();
        let branch = repo.init().await.unwrap();
        (repo, branch)
    }

    async fn add_item(branch: &Branch, role: &str) -> (Version, NodeId) {
        let mut write = branch.write().await.unwrap();
        let id = write.ids().generate();
        write.add_new_child(NodeId::ROOT, Some(role), None, id, None).await.unwrap();
        (write.commit().await.unwrap(), id)
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn commit_advances_head() {
        let (_repo, branch) = master().await;
        let v0 = branch.head().await.unwrap();
        let (v1, id) = add_item(&branch, "items").await;

        assert_eq!(branch.head().await.unwrap(), v1);
        assert_eq!(v1.base_version_hash(), Some(v0.hash()));
        assert_eq!(v1.author(), Some("client-1"));
        assert!(branch.tree().await.unwrap().contains(id).await.unwrap());

        let log = branch.history(10).await.unwrap();
        assert_eq!(log, vec![v1, v0]);
    }

    #[tokio::test]
    async fn empty_write_keeps_head() {
        let (_repo, branch) = master().await;
        let v0 = branch.head().await.unwrap();
        let write = branch.write().await.unwrap();
        assert_eq!(write.commit().await.unwrap(), v0);
        assert_eq!(branch.head().await.unwrap(), v0);
    }

    #[tokio::test]
    async fn dropped_write_is_discarded() {
        let (_repo, branch) = master().await;
        let v0 = branch.head().await.unwrap();
        {
            let mut write = branch.write().await.unwrap();
            let id = write.ids().generate();
            write.add_new_child(NodeId::ROOT, Some("items"), None, id, None).await.unwrap();
        }
        assert_eq!(branch.head().await.unwrap(), v0);
        // The writer lock was released with the write.
        let (v1, _) = add_item(&branch, "items").await;
        assert_ne!(v1, v0);
    }

    #[tokio::test]
    async fn writes_on_one_branch_are_serialized() {
        let (repo, branch) = master().await;
        let other = repo.default_branch().await.unwrap();
        let write = branch.write().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(30), other.write()).await;
        assert!(waiting.is_err());

        drop(write);
        assert!(other.write().await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_clients_are_merged() {
        init_tracing();
        let objects = Arc::new(InMemoryObjectStore::new());
        let heads = Arc::new(InMemoryBranchStore::new());
        let id = RepositoryId::new("models").unwrap();
        let alice = Repository::open(id.clone(), objects.clone(), heads.clone(), config(1));
        let bob = Repository::open(id, objects, heads, config(2));
        let v0 = alice.init().await.unwrap().head().await.unwrap();

        let alice_master = alice.default_branch().await.unwrap();
        let bob_master = bob.default_branch().await.unwrap();
        let mut a = alice_master.write().await.unwrap();
        let mut b = bob_master.write().await.unwrap();
        let a_id = a.ids().generate();
        let b_id = b.ids().generate();
        a.add_new_child(NodeId::ROOT, Some("items"), None, a_id, None).await.unwrap();
        b.add_new_child(NodeId::ROOT, Some("items"), None, b_id, None).await.unwrap();

        let after_alice = a.commit().await.unwrap();
        assert_eq!(after_alice.base_version_hash(), Some(v0.hash()));
        let after_bob = b.commit().await.unwrap();
        assert!(after_bob.is_merge());

        let head = alice_master.head().await.unwrap();
        assert_eq!(head, after_bob);
        let items = head
            .tree()
            .await
            .unwrap()
            .children_in_role(NodeId::ROOT, Some("items"))
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.contains(&a_id) && items.contains(&b_id));
    }

    // ---------------------------------------------------------------
    // Import
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn import_is_idempotent() {
        let (_repo, branch) = master().await;
        let spec = NodeSpec::from_json(MODEL).unwrap();

        let (first, report) = branch.import(&spec).await.unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.references_changed, 1);
        assert_eq!(NodeSpec::export(&first.tree().await.unwrap(), NodeId::ROOT).await.unwrap(), spec);

        let (second, report) = branch.import(&spec).await.unwrap();
        assert!(report.is_unchanged());
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn import_counts_undeclared_concepts() {
        let (_repo, branch) = master().await;
        let spec = NodeSpec::from_json(MODEL).unwrap();
        let schema = DeclaredSchema::new();
        let (_, report) = branch.import_with_schema(&spec, &schema).await.unwrap();
        assert_eq!(report.unresolved_concepts, 2);
        assert_eq!(report.added, 2);
    }

    #[tokio::test]
    async fn tree_changes_are_mirrored() {
        let (repo, source) = master().await;
        let before = source.tree().await.unwrap();
        let spec = NodeSpec::from_json(MODEL).unwrap();
        source.import(&spec).await.unwrap();
        let after = source.tree().await.unwrap();

        let mirror = repo.create_branch("mirror", &source.history(10).await.unwrap()[1]).await.unwrap();
        let mut invalidation = repo.invalidation_tree();
        assert!(invalidate_changes(&mut invalidation, &before, &after).await.unwrap() > 0);
        let (_, report) = mirror.synchronize_from(&after, &invalidation).await.unwrap();
        assert_eq!(report.added, 2);

        let exported = NodeSpec::export(&mirror.tree().await.unwrap(), NodeId::ROOT).await.unwrap();
        assert_eq!(exported, NodeSpec::export(&after, NodeId::ROOT).await.unwrap());

        let (_, report) = mirror.synchronize_from(&after, &AllNodes).await.unwrap();
        assert!(report.is_unchanged());
    }

    #[tokio::test]
    async fn mirrored_unordered_roles_keep_their_order() {
        let (repo, source) = master().await;
        let v0 = source.head().await.unwrap();
        let schema = DeclaredSchema::new().concept("Container", [], ["items"]);
        let container = |ids: &[&str]| {
            let children: Vec<String> = ids
                .iter()
                .map(|id| format!(r#"{{"id": "{id}", "role": "items"}}"#))
                .collect();
            let json = format!(
                r#"{{"id": "root", "concept": "Container", "children": [{}]}}"#,
                children.join(", ")
            );
            NodeSpec::from_json(&json).unwrap()
        };

        source.import(&container(&["A", "B", "C"])).await.unwrap();
        let mirror = repo.create_branch("mirror", &v0).await.unwrap();
        let (_, report) = mirror
            .synchronize_from_with_schema(&source.tree().await.unwrap(), &AllNodes, &schema)
            .await
            .unwrap();
        assert_eq!(report.added, 3);

        source.import(&container(&["C", "A", "B"])).await.unwrap();
        let reordered = source.tree().await.unwrap();
        let (_, report) = mirror
            .synchronize_from_with_schema(&reordered, &AllNodes, &schema)
            .await
            .unwrap();
        assert!(report.is_unchanged(), "{report:?}");

        // Without the schema the role is ordered.
        let (_, report) = mirror.synchronize_from(&reordered, &AllNodes).await.unwrap();
        assert_eq!(report.moved, 1);
    }

    // ---------------------------------------------------------------
    // Undo, revert, merge
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn undo_then_redo() {
        let (_repo, branch) = master().await;
        let (v1, a) = add_item(&branch, "items").await;
        let (_, b) = add_item(&branch, "items").await;

        let undone = branch.undo(&v1).await.unwrap();
        let tree = undone.tree().await.unwrap();
        assert!(!tree.contains(a).await.unwrap());
        assert!(tree.contains(b).await.unwrap());

        let redone = branch.undo(&undone).await.unwrap();
        assert!(redone.tree().await.unwrap().contains(a).await.unwrap());
        assert_eq!(branch.head().await.unwrap(), redone);
    }

    #[tokio::test]
    async fn revert_restores_an_old_tree() {
        let (_repo, branch) = master().await;
        let v0 = branch.head().await.unwrap();
        add_item(&branch, "items").await;
        add_item(&branch, "other").await;

        let reverted = branch.revert_to(&v0).await.unwrap();
        assert_eq!(reverted.tree_hash(), v0.tree_hash());
        assert_ne!(reverted.base_version_hash(), Some(v0.hash()));
        assert_eq!(reverted.reverted_range().await.unwrap().map(|(_, to)| to), Some(v0.hash()));
    }

    #[tokio::test]
    async fn merge_from_other_branch() {
        let (repo, master) = master().await;
        let v0 = master.head().await.unwrap();
        let dev = repo.create_branch("dev", &v0).await.unwrap();

        let (_, on_master) = add_item(&master, "items").await;
        let (dev_head, on_dev) = add_item(&dev, "items").await;

        // Both branches moved since v0.
        let merged = master.merge_from(&dev).await.unwrap();
        assert!(merged.is_merge());
        let tree = merged.tree().await.unwrap();
        assert!(tree.contains(on_master).await.unwrap());
        assert!(tree.contains(on_dev).await.unwrap());

        // dev is behind master now and fast-forwards.
        assert_eq!(dev.merge_from(&master).await.unwrap(), merged);
        assert_ne!(dev.head().await.unwrap(), dev_head);

        assert!(matches!(master.merge_from(&master).await, Err(SdkError::InvalidOperation(_))));
    }
}
