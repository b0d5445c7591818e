//! In-memory branch store for testing and single-process use.
//!
//! [`InMemoryBranchStore`] keeps one `watch` channel per branch in a
//! `HashMap` protected by a `RwLock`. The channel value is the head, so
//! reading, swapping and observing a head all go through the same cell.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use arbor_types::{ObjectHash, RepositoryId};

use crate::error::{RefError, Result};
use crate::traits::BranchStore;
use crate::types::BranchRef;

/// An in-memory implementation of [`BranchStore`].
#[derive(Debug, Default)]
pub struct InMemoryBranchStore {
    heads: RwLock<HashMap<BranchRef, watch::Sender<Option<ObjectHash>>>>,
}

impl InMemoryBranchStore {
    /// Create a new empty branch store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> RefError {
    RefError::Poisoned(e.to_string())
}

#[async_trait]
impl BranchStore for InMemoryBranchStore {
    async fn head(&self, branch: &BranchRef) -> Result<Option<ObjectHash>> {
        let heads = self.heads.read().map_err(poisoned)?;
        Ok(heads.get(branch).and_then(|cell| *cell.borrow()))
    }

    async fn compare_and_swap(
        &self,
        branch: &BranchRef,
        expected: Option<ObjectHash>,
        new: ObjectHash,
    ) -> Result<bool> {
        let mut heads = self.heads.write().map_err(poisoned)?;
        let cell = heads
            .entry(branch.clone())
            .or_insert_with(|| watch::Sender::new(None));
        let current = *cell.borrow();
        if current != expected {
            debug!(%branch, "head changed concurrently");
            return Ok(false);
        }
        cell.send_replace(Some(new));
        debug!(%branch, head = %new.short_hex(), "updated head");
        Ok(true)
    }

    async fn delete(&self, branch: &BranchRef) -> Result<bool> {
        let mut heads = self.heads.write().map_err(poisoned)?;
        match heads.remove(branch) {
            Some(cell) => {
                let existed = cell.borrow().is_some();
                cell.send_replace(None);
                Ok(existed)
            }
            None => Ok(false),
        }
    }

    async fn branches(&self, repository: &RepositoryId) -> Result<Vec<BranchRef>> {
        let heads = self.heads.read().map_err(poisoned)?;
        let mut result: Vec<BranchRef> = heads
            .iter()
            .filter(|(branch, cell)| branch.repository() == repository && cell.borrow().is_some())
            .map(|(branch, _)| branch.clone())
            .collect();
        result.sort();
        Ok(result)
    }

    async fn watch(&self, branch: &BranchRef) -> Result<watch::Receiver<Option<ObjectHash>>> {
        let mut heads = self.heads.write().map_err(poisoned)?;
        Ok(heads
            .entry(branch.clone())
            .or_insert_with(|| watch::Sender::new(None))
            .subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(name: &str) -> BranchRef {
        BranchRef::new(RepositoryId::new("models").unwrap(), name).unwrap()
    }

    fn hash(seed: &str) -> ObjectHash {
        ObjectHash::digest(seed.as_bytes())
    }

    #[tokio::test]
    async fn missing_branch_has_no_head() {
        let store = InMemoryBranchStore::new();
        assert_eq!(store.head(&branch("master")).await.unwrap(), None);
        assert!(!store.delete(&branch("master")).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_creates_and_advances() {
        let store = InMemoryBranchStore::new();
        let master = branch("master");
        assert!(store.compare_and_swap(&master, None, hash("v1")).await.unwrap());
        assert_eq!(store.head(&master).await.unwrap(), Some(hash("v1")));

        assert!(store
            .compare_and_swap(&master, Some(hash("v1")), hash("v2"))
            .await
            .unwrap());
        assert_eq!(store.head(&master).await.unwrap(), Some(hash("v2")));
    }

    #[tokio::test]
    async fn stale_expectation_is_rejected() {
        let store = InMemoryBranchStore::new();
        let master = branch("master");
        store.compare_and_swap(&master, None, hash("v1")).await.unwrap();

        assert!(!store.compare_and_swap(&master, None, hash("x")).await.unwrap());
        assert!(!store
            .compare_and_swap(&master, Some(hash("v0")), hash("x"))
            .await
            .unwrap());
        assert_eq!(store.head(&master).await.unwrap(), Some(hash("v1")));
    }

    #[tokio::test]
    async fn branches_are_listed_per_repository() {
        let store = InMemoryBranchStore::new();
        let other = BranchRef::new(RepositoryId::new("other").unwrap(), "master").unwrap();
        store.compare_and_swap(&branch("dev"), None, hash("a")).await.unwrap();
        store.compare_and_swap(&branch("master"), None, hash("b")).await.unwrap();
        store.compare_and_swap(&other, None, hash("c")).await.unwrap();
        // Watching alone does not create a branch.
        store.watch(&branch("idle")).await.unwrap();

        let listed = store
            .branches(&RepositoryId::new("models").unwrap())
            .await
            .unwrap();
        assert_eq!(listed, vec![branch("dev"), branch("master")]);

        assert!(store.delete(&branch("dev")).await.unwrap());
        assert_eq!(store.head(&branch("dev")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn watchers_see_head_changes() {
        let store = InMemoryBranchStore::new();
        let master = branch("master");
        let mut rx = store.watch(&master).await.unwrap();
        assert_eq!(*rx.borrow(), None);

        store.compare_and_swap(&master, None, hash("v1")).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Some(hash("v1")));
    }
}
