//! Version records and their operation logs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use arbor_store::{ObjectKind, ObjectLoader, Record, StoreError};
use arbor_tree::{Operation, Tree};
use arbor_types::ObjectHash;

use crate::error::{VersionError, VersionResult};

/// Logs with at most this many operations are stored inside the version.
pub const INLINE_OPERATIONS_LIMIT: usize = 10;

/// Where the operations of a version live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationLog {
    Inline(Vec<Operation>),
    /// Hash of an out-of-line [`OperationList`].
    Stored(ObjectHash),
}

/// An operation log stored as its own object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationList {
    pub operations: Vec<Operation>,
}

impl Record for OperationList {
    const KIND: ObjectKind = ObjectKind::Operations;
}

/// The stored form of a version.
///
/// Regular versions have a `base_version`. Merge versions have both merged
/// versions set and use the common base of the two as `base_version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionData {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    pub tree: ObjectHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<ObjectHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_version1: Option<ObjectHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_version2: Option<ObjectHash>,
    pub operations: OperationLog,
    pub operation_count: usize,
}

impl Record for VersionData {
    const KIND: ObjectKind = ObjectKind::Version;
}

/// A written, immutable version.
#[derive(Clone)]
pub struct Version {
    data: VersionData,
    hash: ObjectHash,
    loader: Arc<dyn ObjectLoader>,
}

impl Version {
    pub(crate) fn from_parts(data: VersionData, hash: ObjectHash, loader: Arc<dyn ObjectLoader>) -> Self {
        Self { data, hash, loader }
    }

    /// Load the version stored under `hash`.
    pub async fn load(loader: Arc<dyn ObjectLoader>, hash: &ObjectHash) -> VersionResult<Self> {
        let data = match loader.load_record::<VersionData>(hash).await {
            Ok(data) => data,
            Err(StoreError::NotFound(missing)) if missing == *hash => {
                return Err(VersionError::VersionNotFound(*hash))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::from_parts(data, *hash, loader))
    }

    pub fn hash(&self) -> ObjectHash {
        self.hash
    }

    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn author(&self) -> Option<&str> {
        self.data.author.as_deref()
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.data.time
    }

    pub fn data(&self) -> &VersionData {
        &self.data
    }

    pub fn loader(&self) -> &Arc<dyn ObjectLoader> {
        &self.loader
    }

    pub fn tree_hash(&self) -> ObjectHash {
        self.data.tree
    }

    pub async fn tree(&self) -> VersionResult<Tree> {
        Ok(Tree::load(self.loader.clone(), &self.data.tree).await?)
    }

    pub fn base_version_hash(&self) -> Option<ObjectHash> {
        self.data.base_version
    }

    pub async fn base_version(&self) -> VersionResult<Option<Version>> {
        match self.data.base_version {
            Some(hash) => Ok(Some(Self::load(self.loader.clone(), &hash).await?)),
            None => Ok(None),
        }
    }

    pub fn is_merge(&self) -> bool {
        self.data.merged_version1.is_some() && self.data.merged_version2.is_some()
    }

    /// The two merged versions of a merge version.
    pub fn merged_versions(&self) -> Option<(ObjectHash, ObjectHash)> {
        Some((self.data.merged_version1?, self.data.merged_version2?))
    }

    /// Direct predecessors in the history graph: both merged versions of a
    /// merge, the base of anything else.
    pub fn parents(&self) -> Vec<ObjectHash> {
        match self.merged_versions() {
            Some((a, b)) => vec![a, b],
            None => self.data.base_version.into_iter().collect(),
        }
    }

    pub fn operation_count(&self) -> usize {
        self.data.operation_count
    }

    /// Whether the log is stored out of line.
    pub fn has_stored_operations(&self) -> bool {
        matches!(self.data.operations, OperationLog::Stored(_))
    }

    /// The recorded operations, loading an out-of-line log if needed.
    pub async fn operations(&self) -> VersionResult<Vec<Operation>> {
        match &self.data.operations {
            OperationLog::Inline(ops) => Ok(ops.clone()),
            OperationLog::Stored(hash) => Ok(self
                .loader
                .load_record::<OperationList>(hash)
                .await?
                .operations),
        }
    }

    /// The version an undo version cancels, if this is one.
    pub async fn undone_version(&self) -> VersionResult<Option<ObjectHash>> {
        match self.operations().await?.first() {
            Some(Operation::Undo { version }) => Ok(Some(*version)),
            _ => Ok(None),
        }
    }

    /// `(latest_known, revert_to)` of a revert version.
    pub async fn reverted_range(&self) -> VersionResult<Option<(ObjectHash, ObjectHash)>> {
        match self.operations().await?.first() {
            Some(Operation::Revert {
                latest_known,
                revert_to,
            }) => Ok(Some((*latest_known, *revert_to))),
            _ => Ok(None),
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Version {}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("id", &format_args!("{:x}", self.data.id))
            .field("hash", &self.hash.short_hex())
            .field("merge", &self.is_merge())
            .field("operations", &self.data.operation_count)
            .finish()
    }
}
