//! Creating versions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use arbor_store::{BulkQuery, ObjectLoader, Record};
use arbor_tree::{Operation, Tree};
use arbor_types::{NodeReference, ObjectHash, RepositoryId};

use crate::compress::compress_operations;
use crate::error::VersionResult;
use crate::version::{OperationList, OperationLog, Version, VersionData, INLINE_OPERATIONS_LIMIT};

/// Builds and writes new versions.
///
/// The tree of a version must already be stored (committed) when the
/// version is written.
#[derive(Clone, Debug)]
pub struct VersionBuilder {
    id: u64,
    author: Option<String>,
    time: Option<DateTime<Utc>>,
    inline_limit: usize,
}

impl VersionBuilder {
    /// A builder for version `id`, stamped with the current time.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            author: None,
            time: Some(Utc::now()),
            inline_limit: INLINE_OPERATIONS_LIMIT,
        }
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn time(mut self, time: Option<DateTime<Utc>>) -> Self {
        self.time = time;
        self
    }

    pub fn inline_limit(mut self, limit: usize) -> Self {
        self.inline_limit = limit;
        self
    }

    /// The first version of a repository.
    pub async fn initial(self, tree: &Tree, store: &Arc<BulkQuery>) -> VersionResult<Version> {
        self.write(tree.hash(), tree.repository(), None, None, Vec::new(), store)
            .await
    }

    /// A version produced by editing `base`; bulk imports are compressed.
    pub async fn regular(
        self,
        base: &Version,
        tree: &Tree,
        ops: Vec<Operation>,
        store: &Arc<BulkQuery>,
    ) -> VersionResult<Version> {
        let ops = compress_operations(ops, tree, self.inline_limit);
        self.write(tree.hash(), tree.repository(), Some(base.hash()), None, ops, store)
            .await
    }

    /// The merge of `version1` and `version2` over their common base.
    pub async fn merge(
        self,
        version1: &Version,
        version2: &Version,
        common_base: Option<&Version>,
        tree: &Tree,
        ops: Vec<Operation>,
        store: &Arc<BulkQuery>,
    ) -> VersionResult<Version> {
        self.write(
            tree.hash(),
            tree.repository(),
            common_base.map(Version::hash),
            Some((version1.hash(), version2.hash())),
            ops,
            store,
        )
        .await
    }

    /// A version on top of `base` that cancels `undone`.
    ///
    /// `tree` is the resulting state and `ops` the edits that turn the tree
    /// of `base` into it; the log records them after an `Undo` marker.
    pub async fn undo(
        self,
        base: &Version,
        undone: &Version,
        tree: &Tree,
        ops: Vec<Operation>,
        store: &Arc<BulkQuery>,
    ) -> VersionResult<Version> {
        let mut log = vec![Operation::Undo {
            version: undone.hash(),
        }];
        log.extend(ops);
        self.write(tree.hash(), tree.repository(), Some(base.hash()), None, log, store)
            .await
    }

    /// A version on top of `latest_known` that restores the tree of
    /// `revert_to`.
    ///
    /// `ops` are the edits that turn the tree of `latest_known` into it; the
    /// log records them after a `Revert` marker.
    pub async fn revert(
        self,
        latest_known: &Version,
        revert_to: &Version,
        ops: Vec<Operation>,
        store: &Arc<BulkQuery>,
    ) -> VersionResult<Version> {
        let tree = revert_to.tree().await?;
        let mut log = vec![Operation::Revert {
            latest_known: latest_known.hash(),
            revert_to: revert_to.hash(),
        }];
        log.extend(ops);
        self.write(
            tree.hash(),
            tree.repository(),
            Some(latest_known.hash()),
            None,
            log,
            store,
        )
        .await
    }

    async fn write(
        self,
        tree: ObjectHash,
        repository: &RepositoryId,
        base_version: Option<ObjectHash>,
        merged: Option<(ObjectHash, ObjectHash)>,
        ops: Vec<Operation>,
        store: &Arc<BulkQuery>,
    ) -> VersionResult<Version> {
        let ops = localize(ops, repository);
        let operation_count = ops.len();
        let mut objects = Vec::new();
        let operations = if ops.len() <= self.inline_limit {
            OperationLog::Inline(ops)
        } else {
            let list = OperationList { operations: ops }.to_stored_object()?;
            let hash = list.compute_hash();
            objects.push(list);
            OperationLog::Stored(hash)
        };

        let data = VersionData {
            id: self.id,
            author: self.author,
            time: self.time,
            tree,
            base_version,
            merged_version1: merged.map(|(a, _)| a),
            merged_version2: merged.map(|(_, b)| b),
            operations,
            operation_count,
        };
        let obj = data.to_stored_object()?;
        let hash = obj.compute_hash();
        objects.push(obj);
        store.put_all(objects).await?;

        debug!(
            version = %hash.short_hex(),
            id = %format_args!("{:x}", data.id),
            operations = operation_count,
            merge = merged.is_some(),
            "wrote version"
        );
        let loader: Arc<dyn ObjectLoader> = store.clone();
        Ok(Version::from_parts(data, hash, loader))
    }
}

/// Rewrite global references into the version's own repository as local ones.
fn localize(ops: Vec<Operation>, repository: &RepositoryId) -> Vec<Operation> {
    ops.into_iter()
        .map(|op| match op {
            Operation::SetReference {
                id,
                role,
                target: Some(NodeReference::Global { repository: r, node }),
            } if r == *repository => Operation::SetReference {
                id,
                role,
                target: Some(NodeReference::Local(node)),
            },
            other => other,
        })
        .collect()
}
