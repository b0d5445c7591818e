//! Tracking which parts of a model need to be synchronized again.
//!
//! An [`InvalidationTree`] records the containment paths of changed source
//! nodes. The synchronizer consults it (as a [`SyncFilter`]) to skip
//! subtrees that did not change. To bound memory, a tree that grows past its
//! size limit coarsens some entries into "everything below needs an update".

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use arbor_diff::{diff_trees, TreeChange};
use arbor_tree::Tree;
use arbor_types::NodeId;

use crate::error::{SyncError, SyncResult};

/// Default number of tracked entries before coarsening kicks in.
pub const DEFAULT_INVALIDATION_LIMIT: usize = 100_000;

/// Decides which source nodes a synchronization visits.
///
/// Paths are containment paths from the root of the source tree
/// ([`NodeId::ROOT`]) down to the node in question.
pub trait SyncFilter: Send + Sync {
    /// Whether the node's own data or its children have to be synchronized.
    fn needs_synchronization(&self, path: &[NodeId]) -> bool;

    /// Whether anything at or below the node has to be visited.
    fn needs_descent(&self, path: &[NodeId]) -> bool;
}

/// A filter that visits and synchronizes every node.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllNodes;

impl SyncFilter for AllNodes {
    fn needs_synchronization(&self, _path: &[NodeId]) -> bool {
        true
    }

    fn needs_descent(&self, _path: &[NodeId]) -> bool {
        true
    }
}

#[derive(Clone, Debug)]
struct Entry {
    subtree_size: usize,
    needs_update: bool,
    all_descendants: bool,
    children: HashMap<NodeId, Entry>,
}

impl Entry {
    fn new() -> Self {
        Self {
            subtree_size: 1,
            needs_update: false,
            all_descendants: false,
            children: HashMap::new(),
        }
    }

    /// Mark the end of `path` (relative to this entry); returns the number
    /// of entries created.
    fn invalidate(&mut self, path: &[NodeId]) -> usize {
        let added = match path.split_first() {
            None => {
                self.needs_update = true;
                0
            }
            Some(_) if self.all_descendants => 0,
            Some((first, rest)) => {
                let mut created = 0;
                let child = self.children.entry(*first).or_insert_with(|| {
                    created = 1;
                    Entry::new()
                });
                created + child.invalidate(rest)
            }
        };
        self.subtree_size += added;
        added
    }

    /// Shrink this subtree to at most `limit` entries.
    ///
    /// If the children do not fit at all, they are replaced by the
    /// `all_descendants` flag. Otherwise the budget is taken from the
    /// largest child subtrees first.
    fn rebalance(&mut self, limit: usize) {
        let limit = limit.max(1);
        if self.subtree_size <= limit {
            return;
        }
        if limit - 1 < self.children.len() {
            self.all_descendants = true;
            self.children.clear();
            self.subtree_size = 1;
            return;
        }

        let mut order: Vec<(NodeId, usize)> = self
            .children
            .iter()
            .map(|(id, child)| (*id, child.subtree_size))
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut sizes: Vec<usize> = order.iter().map(|(_, size)| *size).collect();

        let mut excess = self.subtree_size - limit;
        while excess > 0 {
            for i in 0..sizes.len() {
                let mut child_limit = (excess / (i + 1)).max(1);
                if let Some(next) = sizes.get(i + 1) {
                    child_limit = child_limit.max(*next);
                }
                for size in sizes.iter_mut().take(i + 1) {
                    let delta = size.saturating_sub(child_limit).min(excess);
                    *size -= delta;
                    excess -= delta;
                }
                if excess == 0 {
                    break;
                }
            }
        }

        for ((id, _), size) in order.iter().zip(sizes) {
            if let Some(child) = self.children.get_mut(id) {
                child.rebalance(size);
            }
        }
        self.subtree_size = 1 + self.children.values().map(|c| c.subtree_size).sum::<usize>();
    }

    fn needs_update(&self, path: &[NodeId]) -> bool {
        if self.all_descendants {
            return true;
        }
        match path.split_first() {
            None => self.needs_update,
            Some((first, rest)) => self.children.get(first).is_some_and(|c| c.needs_update(rest)),
        }
    }

    fn needs_descent(&self, path: &[NodeId]) -> bool {
        if self.all_descendants {
            return true;
        }
        match path.split_first() {
            None => self.needs_update || !self.children.is_empty(),
            Some((first, rest)) => self.children.get(first).is_some_and(|c| c.needs_descent(rest)),
        }
    }
}

/// The set of invalidated source nodes, stored as a trie of paths.
///
/// Queries are conservative: after coarsening a node may report that it
/// needs an update when it does not, but an invalidated node never reports
/// that it is up to date.
#[derive(Clone, Debug)]
pub struct InvalidationTree {
    size_limit: usize,
    root: Entry,
}

impl InvalidationTree {
    pub fn new(size_limit: usize) -> Self {
        Self {
            size_limit,
            root: Entry::new(),
        }
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Number of entries currently tracked, including the root.
    pub fn tracked_nodes(&self) -> usize {
        self.root.subtree_size
    }

    /// Whether nothing has been invalidated.
    pub fn is_empty(&self) -> bool {
        !self.root.needs_descent(&[])
    }

    /// Mark the node at the end of `path` as changed.
    ///
    /// `path` must start at [`NodeId::ROOT`].
    pub fn invalidate(&mut self, path: &[NodeId]) -> SyncResult<()> {
        match path.split_first() {
            Some((first, rest)) if first.is_root() => {
                self.root.invalidate(rest);
                self.root.rebalance(self.size_limit);
                Ok(())
            }
            Some((first, _)) => Err(SyncError::InvalidPath(format!(
                "path starts at {first} instead of the root"
            ))),
            None => Err(SyncError::InvalidPath("empty path".into())),
        }
    }

    /// Mark `id` as changed, looking up its path in `tree`.
    pub async fn invalidate_node(&mut self, tree: &Tree, id: NodeId) -> SyncResult<()> {
        let mut path = tree.ancestors(id).await?;
        path.reverse();
        path.push(id);
        self.invalidate(&path)
    }

    /// Forget all invalidations.
    pub fn reset(&mut self) {
        self.root = Entry::new();
    }

    fn split_root(path: &[NodeId]) -> Option<&[NodeId]> {
        match path.split_first() {
            Some((first, rest)) if first.is_root() => Some(rest),
            _ => None,
        }
    }
}

impl Default for InvalidationTree {
    fn default() -> Self {
        Self::new(DEFAULT_INVALIDATION_LIMIT)
    }
}

impl SyncFilter for InvalidationTree {
    fn needs_synchronization(&self, path: &[NodeId]) -> bool {
        Self::split_root(path).is_some_and(|rest| self.root.needs_update(rest))
    }

    fn needs_descent(&self, path: &[NodeId]) -> bool {
        Self::split_root(path).is_some_and(|rest| self.root.needs_descent(rest))
    }
}

/// Invalidate every node of `new` affected by the changes from `old` to
/// `new`, so that a following synchronization picks them up.
///
/// Added nodes invalidate themselves and their parent, removed nodes their
/// (surviving) parent. Returns the number of nodes invalidated.
pub async fn invalidate_changes(
    invalidation: &mut InvalidationTree,
    old: &Tree,
    new: &Tree,
) -> SyncResult<usize> {
    let diff = diff_trees(old, new).await?;
    let mut affected = BTreeSet::new();
    for change in &diff.changes {
        match change {
            TreeChange::NodeAdded { node, parent } => {
                affected.insert(*node);
                affected.extend(*parent);
            }
            TreeChange::NodeRemoved { parent, .. } => affected.extend(*parent),
            TreeChange::ContainmentChanged { node } => {
                affected.insert(*node);
                affected.extend(new.parent(*node).await?);
            }
            other => {
                affected.insert(other.node());
            }
        }
    }

    let mut count = 0;
    for id in affected {
        if new.contains(id).await? {
            invalidation.invalidate_node(new, id).await?;
            count += 1;
        }
    }
    debug!(changes = diff.len(), invalidated = count, "invalidated changed nodes");
    Ok(count)
}
