//! Persistent hash trie mapping node ids to node record hashes.
//!
//! Keys are consumed in 6-bit chunks, least significant chunk first, so a
//! trie is at most 11 levels deep. Internal trie nodes carry a 64-bit
//! occupancy bitmap and the hashes of their present children in chunk
//! order.
//!
//! # Canonical shape
//!
//! - The top-level node is always internal (an empty trie is an internal
//!   node with an empty bitmap).
//! - Below the top, a subtree holding exactly one entry is always a leaf.
//!
//! The shape, and therefore the root hash, is a pure function of the
//! mapping: insertion order does not matter. Every mutation rewrites only
//! the root-to-leaf path and stages the new trie nodes in a [`WriteBuffer`].

use std::collections::BTreeMap;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use arbor_store::{ObjectKind, ObjectLoader, Record, WriteBuffer};
use arbor_types::{NodeId, ObjectHash};

use crate::error::{TreeError, TreeResult};

const BITS_PER_LEVEL: u32 = 6;
const LEVEL_MASK: u64 = (1 << BITS_PER_LEVEL) - 1;
/// Number of levels needed to consume a 64-bit key.
pub const MAX_DEPTH: u32 = 64_u32.div_ceil(BITS_PER_LEVEL);

/// A node of the hash trie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrieNode {
    Internal {
        bitmap: u64,
        children: Vec<ObjectHash>,
    },
    Leaf {
        key: NodeId,
        value: ObjectHash,
    },
}

impl Record for TrieNode {
    const KIND: ObjectKind = ObjectKind::TrieNode;
}

impl TrieNode {
    pub fn empty() -> Self {
        Self::Internal {
            bitmap: 0,
            children: Vec::new(),
        }
    }
}

/// An entry that differs between two tries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrieChange {
    pub key: NodeId,
    /// Value in the old trie (`None` if added).
    pub old: Option<ObjectHash>,
    /// Value in the new trie (`None` if removed).
    pub new: Option<ObjectHash>,
}

fn chunk(key: NodeId, level: u32) -> u32 {
    ((key.as_u64() >> (level * BITS_PER_LEVEL)) & LEVEL_MASK) as u32
}

/// Position of `chunk` among the children of a node with `bitmap`.
fn slot(bitmap: u64, chunk: u32) -> usize {
    (bitmap & ((1u64 << chunk) - 1)).count_ones() as usize
}

async fn load(loader: &dyn ObjectLoader, hash: &ObjectHash) -> TreeResult<TrieNode> {
    Ok(loader.load_record::<TrieNode>(hash).await?)
}

/// Stage an empty trie and return its root hash.
pub fn empty_root(buffer: &WriteBuffer) -> TreeResult<ObjectHash> {
    Ok(buffer.stage_record(&TrieNode::empty())?)
}

// ---------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------

/// The value stored under `key`, if any.
pub async fn get(
    loader: &dyn ObjectLoader,
    root: &ObjectHash,
    key: NodeId,
) -> TreeResult<Option<ObjectHash>> {
    let mut current = *root;
    for level in 0..MAX_DEPTH {
        match load(loader, &current).await? {
            TrieNode::Leaf { key: k, value } => return Ok((k == key).then_some(value)),
            TrieNode::Internal { bitmap, children } => {
                let c = chunk(key, level);
                if bitmap & (1 << c) == 0 {
                    return Ok(None);
                }
                current = children[slot(bitmap, c)];
            }
        }
    }
    match load(loader, &current).await? {
        TrieNode::Leaf { key: k, value } if k == key => Ok(Some(value)),
        TrieNode::Leaf { .. } => Ok(None),
        TrieNode::Internal { .. } => Err(TreeError::Corrupt(format!(
            "trie deeper than {MAX_DEPTH} levels"
        ))),
    }
}

/// All entries of the trie, sorted by key.
///
/// The trie is loaded level by level so a batching loader fetches each
/// level in one round trip.
pub async fn entries(
    loader: &dyn ObjectLoader,
    root: &ObjectHash,
) -> TreeResult<Vec<(NodeId, ObjectHash)>> {
    let mut result = Vec::new();
    let mut frontier = vec![*root];
    while !frontier.is_empty() {
        let nodes = try_join_all(frontier.iter().map(|h| load(loader, h))).await?;
        frontier = Vec::new();
        for node in nodes {
            match node {
                TrieNode::Leaf { key, value } => result.push((key, value)),
                TrieNode::Internal { children, .. } => frontier.extend(children),
            }
        }
    }
    result.sort_by_key(|(key, _)| *key);
    Ok(result)
}

// ---------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------

/// Insert or replace `key`, returning the new root hash.
pub async fn insert(
    buffer: &WriteBuffer,
    root: &ObjectHash,
    key: NodeId,
    value: ObjectHash,
) -> TreeResult<ObjectHash> {
    insert_at(buffer, *root, 0, key, value).await
}

fn insert_at(
    buffer: &WriteBuffer,
    node: ObjectHash,
    level: u32,
    key: NodeId,
    value: ObjectHash,
) -> BoxFuture<'_, TreeResult<ObjectHash>> {
    async move {
        match load(buffer, &node).await? {
            TrieNode::Leaf { key: existing, .. } if existing == key => {
                Ok(buffer.stage_record(&TrieNode::Leaf { key, value })?)
            }
            TrieNode::Leaf { key: existing, value: existing_value } => {
                let old_leaf = buffer.stage_record(&TrieNode::Leaf {
                    key: existing,
                    value: existing_value,
                })?;
                let new_leaf = buffer.stage_record(&TrieNode::Leaf { key, value })?;
                split(buffer, level, (existing, old_leaf), (key, new_leaf))
            }
            TrieNode::Internal {
                mut bitmap,
                mut children,
            } => {
                let c = chunk(key, level);
                let idx = slot(bitmap, c);
                if bitmap & (1 << c) != 0 {
                    children[idx] = insert_at(buffer, children[idx], level + 1, key, value).await?;
                } else {
                    let leaf = buffer.stage_record(&TrieNode::Leaf { key, value })?;
                    children.insert(idx, leaf);
                    bitmap |= 1 << c;
                }
                Ok(buffer.stage_record(&TrieNode::Internal { bitmap, children })?)
            }
        }
    }
    .boxed()
}

/// Build the internal chain that separates two leaves starting at `level`.
fn split(
    buffer: &WriteBuffer,
    level: u32,
    a: (NodeId, ObjectHash),
    b: (NodeId, ObjectHash),
) -> TreeResult<ObjectHash> {
    if level >= MAX_DEPTH {
        return Err(TreeError::Corrupt(format!(
            "keys {} and {} collide on every level",
            a.0, b.0
        )));
    }
    let (ca, cb) = (chunk(a.0, level), chunk(b.0, level));
    let node = if ca == cb {
        TrieNode::Internal {
            bitmap: 1 << ca,
            children: vec![split(buffer, level + 1, a, b)?],
        }
    } else {
        let children = if ca < cb { vec![a.1, b.1] } else { vec![b.1, a.1] };
        TrieNode::Internal {
            bitmap: (1 << ca) | (1 << cb),
            children,
        }
    };
    Ok(buffer.stage_record(&node)?)
}

enum Removal {
    Absent,
    Emptied,
    Replaced(ObjectHash),
}

/// Remove `key`, returning the new root hash (unchanged if absent).
pub async fn remove(
    buffer: &WriteBuffer,
    root: &ObjectHash,
    key: NodeId,
) -> TreeResult<ObjectHash> {
    match remove_at(buffer, *root, 0, key).await? {
        Removal::Absent => Ok(*root),
        Removal::Emptied => empty_root(buffer),
        Removal::Replaced(hash) => Ok(hash),
    }
}

fn remove_at(
    buffer: &WriteBuffer,
    node: ObjectHash,
    level: u32,
    key: NodeId,
) -> BoxFuture<'_, TreeResult<Removal>> {
    async move {
        let (mut bitmap, mut children) = match load(buffer, &node).await? {
            TrieNode::Leaf { key: existing, .. } if existing == key => return Ok(Removal::Emptied),
            TrieNode::Leaf { .. } => return Ok(Removal::Absent),
            TrieNode::Internal { bitmap, children } => (bitmap, children),
        };
        let c = chunk(key, level);
        if bitmap & (1 << c) == 0 {
            return Ok(Removal::Absent);
        }
        let idx = slot(bitmap, c);
        match remove_at(buffer, children[idx], level + 1, key).await? {
            Removal::Absent => return Ok(Removal::Absent),
            Removal::Emptied => {
                children.remove(idx);
                bitmap &= !(1 << c);
            }
            Removal::Replaced(hash) => children[idx] = hash,
        }

        // Below the top level a lone leaf replaces its parent.
        if level > 0 {
            match children.as_slice() {
                [] => return Ok(Removal::Emptied),
                [only] => {
                    if let TrieNode::Leaf { .. } = load(buffer, only).await? {
                        return Ok(Removal::Replaced(*only));
                    }
                }
                _ => {}
            }
        }
        Ok(Removal::Replaced(
            buffer.stage_record(&TrieNode::Internal { bitmap, children })?,
        ))
    }
    .boxed()
}

// ---------------------------------------------------------------
// Diff
// ---------------------------------------------------------------

/// Entries that differ between two tries, sorted by key.
///
/// Both tries are walked in lock-step; subtrees with equal hashes are
/// skipped without being loaded.
pub async fn diff(
    loader: &dyn ObjectLoader,
    old_root: &ObjectHash,
    new_root: &ObjectHash,
) -> TreeResult<Vec<TrieChange>> {
    let mut changes = Vec::new();
    diff_at(loader, *old_root, *new_root, &mut changes).await?;
    changes.sort_by_key(|c| c.key);
    Ok(changes)
}

fn diff_at<'a>(
    loader: &'a dyn ObjectLoader,
    old: ObjectHash,
    new: ObjectHash,
    out: &'a mut Vec<TrieChange>,
) -> BoxFuture<'a, TreeResult<()>> {
    async move {
        if old == new {
            return Ok(());
        }
        let (old_node, new_node) = futures::try_join!(load(loader, &old), load(loader, &new))?;
        match (old_node, new_node) {
            (
                TrieNode::Internal {
                    bitmap: old_bits,
                    children: old_children,
                },
                TrieNode::Internal {
                    bitmap: new_bits,
                    children: new_children,
                },
            ) => {
                for c in 0..64u32 {
                    let bit = 1u64 << c;
                    let in_old = old_bits & bit != 0;
                    let in_new = new_bits & bit != 0;
                    match (in_old, in_new) {
                        (true, true) => {
                            let o = old_children[slot(old_bits, c)];
                            let n = new_children[slot(new_bits, c)];
                            diff_at(loader, o, n, out).await?;
                        }
                        (true, false) => {
                            for (key, value) in entries(loader, &old_children[slot(old_bits, c)]).await? {
                                out.push(TrieChange { key, old: Some(value), new: None });
                            }
                        }
                        (false, true) => {
                            for (key, value) in entries(loader, &new_children[slot(new_bits, c)]).await? {
                                out.push(TrieChange { key, old: None, new: Some(value) });
                            }
                        }
                        (false, false) => {}
                    }
                }
                Ok(())
            }
            // A leaf on either side: compare the (small) entry sets directly.
            _ => {
                let before: BTreeMap<NodeId, ObjectHash> =
                    entries(loader, &old).await?.into_iter().collect();
                let mut after: BTreeMap<NodeId, ObjectHash> =
                    entries(loader, &new).await?.into_iter().collect();
                for (key, value) in before {
                    match after.remove(&key) {
                        Some(v) if v == value => {}
                        Some(v) => out.push(TrieChange { key, old: Some(value), new: Some(v) }),
                        None => out.push(TrieChange { key, old: Some(value), new: None }),
                    }
                }
                for (key, value) in after {
                    out.push(TrieChange { key, old: None, new: Some(value) });
                }
                Ok(())
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use arbor_store::{BulkQuery, BulkQueryConfig, InMemoryObjectStore};

    use super::*;

    fn buffer() -> WriteBuffer {
        let store = Arc::new(InMemoryObjectStore::new());
        WriteBuffer::new(Arc::new(BulkQuery::new(store, &BulkQueryConfig::default())))
    }

    fn value(key: u64) -> ObjectHash {
        ObjectHash::digest(&key.to_be_bytes())
    }

    async fn build(buf: &WriteBuffer, keys: &[u64]) -> ObjectHash {
        let mut root = empty_root(buf).unwrap();
        for &k in keys {
            root = insert(buf, &root, NodeId::new(k), value(k)).await.unwrap();
        }
        root
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Lookup and mutation
    // -----------------------------------------------------------------------

    #[test]
    fn max_depth_covers_64_bits() {
        assert_eq!(MAX_DEPTH, 11);
    }

    #[tokio::test]
    async fn insert_then_get() {
        let buf = buffer();
        // 2 and 66 share their lowest chunk.
        let root = build(&buf, &[1, 2, 66, u64::MAX]).await;
        for k in [1, 2, 66, u64::MAX] {
            assert_eq!(get(&buf, &root, NodeId::new(k)).await.unwrap(), Some(value(k)));
        }
        assert_eq!(get(&buf, &root, NodeId::new(130)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn replace_value() {
        let buf = buffer();
        let root = build(&buf, &[5]).await;
        let root = insert(&buf, &root, NodeId::new(5), value(99)).await.unwrap();
        assert_eq!(get(&buf, &root, NodeId::new(5)).await.unwrap(), Some(value(99)));
        assert_eq!(entries(&buf, &root).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_restores_previous_shape() {
        let buf = buffer();
        let small = build(&buf, &[1, 2]).await;
        let big = insert(&buf, &small, NodeId::new(2 + (1 << 6)), value(66)).await.unwrap();
        assert_ne!(small, big);
        let removed = remove(&buf, &big, NodeId::new(66)).await.unwrap();
        assert_eq!(removed, small);
    }

    #[tokio::test]
    async fn remove_absent_is_noop() {
        let buf = buffer();
        let root = build(&buf, &[1, 2, 3]).await;
        assert_eq!(remove(&buf, &root, NodeId::new(4)).await.unwrap(), root);
    }

    #[tokio::test]
    async fn remove_everything_yields_empty() {
        let buf = buffer();
        let empty = empty_root(&buf).unwrap();
        let mut root = build(&buf, &[10, 74, 138]).await;
        for k in [74, 10, 138] {
            root = remove(&buf, &root, NodeId::new(k)).await.unwrap();
        }
        assert_eq!(root, empty);
    }

    // -----------------------------------------------------------------------
    // Diff
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn diff_reports_added_removed_changed() {
        let buf = buffer();
        let old = build(&buf, &[1, 2, 3, 67]).await;
        let mut new = remove(&buf, &old, NodeId::new(2)).await.unwrap();
        new = insert(&buf, &new, NodeId::new(4), value(4)).await.unwrap();
        new = insert(&buf, &new, NodeId::new(67), value(0)).await.unwrap();

        let changes = diff(&buf, &old, &new).await.unwrap();
        assert_eq!(
            changes,
            vec![
                TrieChange { key: NodeId::new(2), old: Some(value(2)), new: None },
                TrieChange { key: NodeId::new(4), old: None, new: Some(value(4)) },
                TrieChange { key: NodeId::new(67), old: Some(value(67)), new: Some(value(0)) },
            ]
        );
        assert!(diff(&buf, &old, &old).await.unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Determinism
    // -----------------------------------------------------------------------

    proptest! {
        #[test]
        fn root_hash_ignores_insertion_order(
            keys in prop::collection::btree_set(2u64..20_000, 1..60),
            seed in any::<u64>(),
        ) {
            let rt = runtime();
            let sorted: Vec<u64> = keys.into_iter().collect();
            let mut shuffled = sorted.clone();
            // Deterministic shuffle driven by the seed.
            let n = shuffled.len();
            for i in (1..n).rev() {
                let j = (seed.rotate_left(i as u32) as usize) % (i + 1);
                shuffled.swap(i, j);
            }
            let buf = buffer();
            let (a, b) = rt.block_on(async {
                (build(&buf, &sorted).await, build(&buf, &shuffled).await)
            });
            prop_assert_eq!(a, b);
        }

        #[test]
        fn removal_matches_fresh_build(
            keys in prop::collection::btree_set(any::<u64>(), 1..40),
            drop_every in 2usize..5,
        ) {
            let rt = runtime();
            let all: Vec<u64> = keys.into_iter().collect();
            let kept: Vec<u64> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| i % drop_every != 0)
                .map(|(_, k)| *k)
                .collect();
            let buf = buffer();
            let (pruned, fresh) = rt.block_on(async {
                let mut root = build(&buf, &all).await;
                for (i, k) in all.iter().enumerate() {
                    if i % drop_every == 0 {
                        root = remove(&buf, &root, NodeId::new(*k)).await.unwrap();
                    }
                }
                (root, build(&buf, &kept).await)
            });
            prop_assert_eq!(pruned, fresh);
        }
    }
}
