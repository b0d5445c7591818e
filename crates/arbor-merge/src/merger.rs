//! Three-way merge of versions.
//!
//! Merging replays every version that is new on either side, in a
//! deterministic linear order, on top of the tree of the common base.
//! Each operation is first re-run on the tree it was originally applied to
//! so that its intent can be captured, then restored against the merge
//! result. Operations that no longer apply are recorded as `NoOp`.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use arbor_store::BulkQuery;
use arbor_tree::{Operation, Tree, WriteTransaction};
use arbor_types::{IdGenerator, ObjectHash};
use arbor_version::{common_base, is_ancestor, linear_history, Version, VersionBuilder, INLINE_OPERATIONS_LIMIT};

use crate::cancel::drop_cancelled;
use crate::error::{MergeError, MergeResult};
use crate::intent::Intent;
use crate::inverse::{base_tree, inverse_operations, replayable_operations};

/// Merges, undoes and reverts versions of one store.
pub struct VersionMerger {
    store: Arc<BulkQuery>,
    ids: Arc<dyn IdGenerator>,
    author: Option<String>,
    inline_limit: usize,
}

impl VersionMerger {
    pub fn new(store: Arc<BulkQuery>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            store,
            ids,
            author: None,
            inline_limit: INLINE_OPERATIONS_LIMIT,
        }
    }

    /// Author recorded on undo and revert versions. Merge versions are
    /// never attributed.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_inline_limit(mut self, limit: usize) -> Self {
        self.inline_limit = limit;
        self
    }

    pub fn store(&self) -> &Arc<BulkQuery> {
        &self.store
    }

    fn builder(&self) -> VersionBuilder {
        let builder = VersionBuilder::new(self.ids.generate().as_u64()).inline_limit(self.inline_limit);
        match &self.author {
            Some(author) => builder.author(author.clone()),
            None => builder,
        }
    }

    async fn check_repository(&self, left: &Version, right: &Version) -> MergeResult<Tree> {
        let left_tree = left.tree().await?;
        let right_tree = right.tree().await?;
        if left_tree.repository() != right_tree.repository() {
            return Err(MergeError::RepositoryMismatch {
                left: left_tree.repository().to_string(),
                right: right_tree.repository().to_string(),
            });
        }
        Ok(left_tree)
    }

    /// Merge `left` and `right`.
    ///
    /// Returns one of the inputs when no merge version is needed: both are
    /// the same version, one contains the other, or both contain the same
    /// regular versions (the one with the lower id is kept).
    pub async fn merge(&self, left: &Version, right: &Version) -> MergeResult<Version> {
        if left.hash() == right.hash() {
            return Ok(left.clone());
        }
        let left_tree = self.check_repository(left, right).await?;

        let base = common_base(left, right).await?;
        let base_hash = base.as_ref().map(Version::hash);
        if base_hash == Some(left.hash()) {
            debug!(version = %right.hash().short_hex(), "fast-forward merge");
            return Ok(right.clone());
        }
        if base_hash == Some(right.hash()) {
            debug!(version = %left.hash().short_hex(), "fast-forward merge");
            return Ok(left.clone());
        }

        // The base chain of a merge version skips its inputs.
        if is_ancestor(&left.hash(), right).await? {
            debug!(version = %right.hash().short_hex(), "fast-forward to merge version");
            return Ok(right.clone());
        }
        if is_ancestor(&right.hash(), left).await? {
            debug!(version = %left.hash().short_hex(), "fast-forward to merge version");
            return Ok(left.clone());
        }

        let left_only = regular_versions(base_hash.as_ref(), left).await?;
        let right_only = regular_versions(base_hash.as_ref(), right).await?;
        if left_only == right_only {
            let kept = if left.id() <= right.id() { left } else { right };
            debug!(version = %kept.hash().short_hex(), "both sides contain the same versions");
            return Ok(kept.clone());
        }

        let history = drop_cancelled(linear_history(base_hash.as_ref(), left, right).await?).await?;
        let start = match &base {
            Some(base) => base.tree().await?,
            None => Tree::create_empty(left_tree.repository().clone(), &self.store).await?,
        };

        let mut merged = WriteTransaction::new(&start, self.store.clone());
        let mut applied: Vec<Operation> = Vec::new();
        for version in &history {
            for intent in capture_version(version, &self.store).await? {
                applied.extend(intent.restore(&mut merged).await?);
            }
        }
        let (tree, _) = merged.commit().await?;

        let conflicts = applied.iter().filter(|op| op.is_noop()).count();
        let version = VersionBuilder::new(self.ids.generate().as_u64())
            .time(None)
            .inline_limit(self.inline_limit)
            .merge(left, right, base.as_ref(), &tree, applied, &self.store)
            .await?;
        info!(
            left = %left.hash().short_hex(),
            right = %right.hash().short_hex(),
            base = ?base_hash.map(|h| h.short_hex()),
            replayed = history.len(),
            noops = conflicts,
            merged = %version.hash().short_hex(),
            "merged versions"
        );
        Ok(version)
    }

    /// A new version on top of `head` that cancels the changes of `undone`.
    ///
    /// Changes made after `undone` are kept; inverse edits that no longer
    /// apply are skipped.
    pub async fn undo(&self, head: &Version, undone: &Version) -> MergeResult<Version> {
        self.check_repository(head, undone).await?;
        let inverse = inverse_operations(undone, &self.store).await?;
        let (tree, ops) = self.apply_inverse(head, inverse).await?;
        let version = self.builder().undo(head, undone, &tree, ops, &self.store).await?;
        info!(
            head = %head.hash().short_hex(),
            undone = %undone.hash().short_hex(),
            version = %version.hash().short_hex(),
            "undid version"
        );
        Ok(version)
    }

    /// A new version on top of `head` whose tree is the tree of
    /// `revert_to`, which must be an ancestor of `head`.
    pub async fn revert(&self, head: &Version, revert_to: &Version) -> MergeResult<Version> {
        if !is_ancestor(&revert_to.hash(), head).await? {
            return Err(MergeError::NotAncestor {
                version: revert_to.hash(),
                head: head.hash(),
            });
        }
        let rolled_back = linear_history(Some(&revert_to.hash()), head, head).await?;
        let mut inverse = Vec::new();
        for version in rolled_back.iter().rev() {
            inverse.extend(inverse_operations(version, &self.store).await?);
        }
        let (_, ops) = self.apply_inverse(head, inverse).await?;
        let version = self.builder().revert(head, revert_to, ops, &self.store).await?;
        info!(
            head = %head.hash().short_hex(),
            revert_to = %revert_to.hash().short_hex(),
            rolled_back = rolled_back.len(),
            version = %version.hash().short_hex(),
            "reverted versions"
        );
        Ok(version)
    }

    async fn apply_inverse(&self, head: &Version, inverse: Vec<Operation>) -> MergeResult<(Tree, Vec<Operation>)> {
        let mut tx = WriteTransaction::new(&head.tree().await?, self.store.clone());
        for op in inverse {
            Intent::positional(op).restore(&mut tx).await?;
        }
        Ok(tx.commit().await?)
    }
}

impl std::fmt::Debug for VersionMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionMerger")
            .field("author", &self.author)
            .field("inline_limit", &self.inline_limit)
            .finish_non_exhaustive()
    }
}

/// Hashes of the regular versions reachable from `tip` but not through
/// `base`.
async fn regular_versions(base: Option<&ObjectHash>, tip: &Version) -> MergeResult<HashSet<ObjectHash>> {
    Ok(linear_history(base, tip, tip)
        .await?
        .iter()
        .map(Version::hash)
        .collect())
}

/// Replay the operations of `version` on its base tree, capturing the
/// intent of each.
async fn capture_version(version: &Version, store: &Arc<BulkQuery>) -> MergeResult<Vec<Intent>> {
    let ops = replayable_operations(version, store).await?;
    if ops.is_empty() {
        return Ok(Vec::new());
    }
    let mut tx = WriteTransaction::new(&base_tree(version, store).await?, store.clone());
    let mut intents = Vec::with_capacity(ops.len());
    for op in &ops {
        intents.push(Intent::capture(&tx, op).await?);
        tx.apply(op).await?;
    }
    Ok(intents)
}
