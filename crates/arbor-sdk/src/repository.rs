use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use arbor_merge::VersionMerger;
use arbor_refs::{BranchRef, BranchStore, InMemoryBranchStore, DEFAULT_BRANCH};
use arbor_store::{BulkQuery, InMemoryObjectStore, ObjectStore};
use arbor_sync::InvalidationTree;
use arbor_tree::Tree;
use arbor_types::{IdGenerator, ObjectHash, RepositoryId};
use arbor_version::{Version, VersionBuilder};

use crate::branch::Branch;
use crate::config::RepositoryConfig;
use crate::error::{SdkError, SdkResult};
use crate::protocol::LocalHeadService;

/// High-level Arbor repository API.
///
/// Owns the object store, the branch heads and the id generator of one
/// client. Work happens on [`Branch`] handles; handles for the same branch
/// share a writer lock.
pub struct Repository {
    id: RepositoryId,
    config: RepositoryConfig,
    store: Arc<BulkQuery>,
    ids: Arc<dyn IdGenerator>,
    heads: Arc<LocalHeadService>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Repository {
    pub fn open(
        id: RepositoryId,
        backend: Arc<dyn ObjectStore>,
        branches: Arc<dyn BranchStore>,
        config: RepositoryConfig,
    ) -> Self {
        let store = Arc::new(BulkQuery::new(backend, &config.bulk()));
        let ids: Arc<dyn IdGenerator> = Arc::new(config.id_generator());
        let mut merger =
            VersionMerger::new(store.clone(), ids.clone()).with_inline_limit(config.inline_operations_limit);
        if let Some(author) = &config.author {
            merger = merger.with_author(author.clone());
        }
        let heads = LocalHeadService::new(store.clone(), branches, merger).with_poll_timeout(config.poll_timeout());
        debug!(repository = %id, "opened repository");
        Self {
            id,
            config,
            store,
            ids,
            heads: Arc::new(heads),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// A repository backed by in-memory object and branch stores.
    pub fn in_memory(id: &str, config: RepositoryConfig) -> SdkResult<Self> {
        Ok(Self::open(
            RepositoryId::new(id)?,
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(InMemoryBranchStore::new()),
            config,
        ))
    }

    /// Create the default branch with an empty initial version, or return
    /// it if it already exists.
    pub async fn init(&self) -> SdkResult<Branch> {
        let branch = BranchRef::default_branch(self.id.clone());
        if self.heads.branches().head(&branch).await?.is_none() {
            let empty = Tree::create_empty(self.id.clone(), &self.store).await?;
            let initial = self.builder().initial(&empty, &self.store).await?;
            if self
                .heads
                .branches()
                .compare_and_swap(&branch, None, initial.hash())
                .await?
            {
                info!(repository = %self.id, head = %initial.hash().short_hex(), "initialized repository");
            }
        }
        Ok(self.handle(branch))
    }

    // ---- Branches ----

    /// A handle on an existing branch.
    pub async fn branch(&self, name: &str) -> SdkResult<Branch> {
        let branch = BranchRef::new(self.id.clone(), name)?;
        if self.heads.branches().head(&branch).await?.is_none() {
            return Err(SdkError::BranchNotFound(branch.to_string()));
        }
        Ok(self.handle(branch))
    }

    pub async fn default_branch(&self) -> SdkResult<Branch> {
        self.branch(DEFAULT_BRANCH).await
    }

    /// Create branch `name` pointing at `from`.
    pub async fn create_branch(&self, name: &str, from: &Version) -> SdkResult<Branch> {
        let branch = BranchRef::new(self.id.clone(), name)?;
        if !self
            .heads
            .branches()
            .compare_and_swap(&branch, None, from.hash())
            .await?
        {
            return Err(SdkError::BranchExists(branch.to_string()));
        }
        info!(%branch, head = %from.hash().short_hex(), "created branch");
        Ok(self.handle(branch))
    }

    pub async fn delete_branch(&self, name: &str) -> SdkResult<()> {
        let branch = BranchRef::new(self.id.clone(), name)?;
        if !self.heads.branches().delete(&branch).await? {
            return Err(SdkError::BranchNotFound(branch.to_string()));
        }
        info!(%branch, "deleted branch");
        Ok(())
    }

    pub async fn branches(&self) -> SdkResult<Vec<BranchRef>> {
        Ok(self.heads.branches().branches(&self.id).await?)
    }

    // ---- Versions ----

    pub async fn version(&self, hash: &ObjectHash) -> SdkResult<Version> {
        self.heads.load(hash).await
    }

    /// Merge two versions without moving any branch.
    pub async fn merge(&self, left: &Version, right: &Version) -> SdkResult<Version> {
        Ok(self.heads.merger().merge(left, right).await?)
    }

    // ---- Accessors ----

    pub fn id(&self) -> &RepositoryId {
        &self.id
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<BulkQuery> {
        &self.store
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    /// The branch-head service, for serving other clients.
    pub fn head_service(&self) -> &Arc<LocalHeadService> {
        &self.heads
    }

    /// An empty invalidation tree sized by the configuration.
    pub fn invalidation_tree(&self) -> InvalidationTree {
        InvalidationTree::new(self.config.invalidation_limit)
    }

    fn builder(&self) -> VersionBuilder {
        let builder = VersionBuilder::new(self.ids.generate().as_u64()).inline_limit(self.config.inline_operations_limit);
        match &self.config.author {
            Some(author) => builder.author(author.clone()),
            None => builder,
        }
    }

    fn handle(&self, branch: BranchRef) -> Branch {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(branch.name().to_string())
            .or_default()
            .clone();
        Branch::new(
            branch,
            self.store.clone(),
            self.ids.clone(),
            self.heads.clone(),
            self.config.clone(),
            lock,
        )
    }
}
