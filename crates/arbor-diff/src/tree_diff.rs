//! Tree-level diff: compare two snapshots and produce node-level changes.
//!
//! The node indices are compared first; only nodes whose record hash
//! differs are loaded and compared field by field.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use arbor_tree::{NodeData, Tree};
use arbor_types::NodeId;

use crate::error::{DiffError, DiffResult};
use crate::map_diff::diff_maps;

/// The result of comparing two trees.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub changes: Vec<TreeChange>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Every node touched by some change, sorted.
    pub fn affected_nodes(&self) -> BTreeSet<NodeId> {
        self.changes.iter().map(TreeChange::node).collect()
    }
}

/// A single change between two trees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeChange {
    /// A node exists only in the new tree.
    NodeAdded { node: NodeId, parent: Option<NodeId> },
    /// A node exists only in the old tree.
    NodeRemoved { node: NodeId, parent: Option<NodeId> },
    /// The value of a property role changed.
    PropertyChanged { node: NodeId, role: String },
    /// The target of a reference role changed.
    ReferenceChanged { node: NodeId, role: String },
    /// The concept of a node changed.
    ConceptChanged { node: NodeId },
    /// The membership or order of the children in a role changed.
    ChildrenChanged { node: NodeId, role: Option<String> },
    /// A node moved to another parent or role.
    ContainmentChanged { node: NodeId },
}

impl TreeChange {
    /// The node the change is reported on.
    pub fn node(&self) -> NodeId {
        match self {
            Self::NodeAdded { node, .. }
            | Self::NodeRemoved { node, .. }
            | Self::PropertyChanged { node, .. }
            | Self::ReferenceChanged { node, .. }
            | Self::ConceptChanged { node }
            | Self::ChildrenChanged { node, .. }
            | Self::ContainmentChanged { node } => *node,
        }
    }
}

/// Compare two snapshots of the same repository.
pub async fn diff_trees(old: &Tree, new: &Tree) -> DiffResult<TreeDiff> {
    if old.repository() != new.repository() {
        return Err(DiffError::RepositoryMismatch {
            old: old.repository().to_string(),
            new: new.repository().to_string(),
        });
    }
    if old == new {
        return Ok(TreeDiff::default());
    }

    let entry_changes = arbor_tree::trie::diff(&**new.loader(), old.nodes_root(), new.nodes_root()).await?;
    let mut changes = Vec::new();
    for change in entry_changes {
        match (change.old.is_some(), change.new.is_some()) {
            (false, true) => {
                let node = new.node(change.key).await?;
                changes.push(TreeChange::NodeAdded {
                    node: node.id,
                    parent: node.parent,
                });
            }
            (true, false) => {
                let node = old.node(change.key).await?;
                changes.push(TreeChange::NodeRemoved {
                    node: node.id,
                    parent: node.parent,
                });
            }
            _ => {
                let before = old.node(change.key).await?;
                let after = new.node(change.key).await?;
                diff_node(old, new, &before, &after, &mut changes).await?;
            }
        }
    }

    debug!(
        old = %old.hash().short_hex(),
        new = %new.hash().short_hex(),
        changes = changes.len(),
        "diffed trees"
    );
    Ok(TreeDiff { changes })
}

async fn diff_node(
    old_tree: &Tree,
    new_tree: &Tree,
    old: &NodeData,
    new: &NodeData,
    out: &mut Vec<TreeChange>,
) -> DiffResult<()> {
    let node = new.id;
    if old.parent != new.parent || old.role != new.role {
        out.push(TreeChange::ContainmentChanged { node });
    }
    if old.concept != new.concept {
        out.push(TreeChange::ConceptChanged { node });
    }
    for role in diff_maps(&old.properties, &new.properties).roles() {
        out.push(TreeChange::PropertyChanged {
            node,
            role: role.to_owned(),
        });
    }
    for role in diff_maps(&old.references, &new.references).roles() {
        out.push(TreeChange::ReferenceChanged {
            node,
            role: role.to_owned(),
        });
    }
    if old.children != new.children {
        let before = children_by_role(old_tree, &old.children).await?;
        let after = children_by_role(new_tree, &new.children).await?;
        let roles: BTreeSet<&Option<String>> = before.keys().chain(after.keys()).collect();
        for role in roles {
            if before.get(role) != after.get(role) {
                out.push(TreeChange::ChildrenChanged {
                    node,
                    role: role.clone(),
                });
            }
        }
    }
    Ok(())
}

async fn children_by_role(
    tree: &Tree,
    children: &[NodeId],
) -> DiffResult<BTreeMap<Option<String>, Vec<NodeId>>> {
    let mut by_role: BTreeMap<Option<String>, Vec<NodeId>> = BTreeMap::new();
    for child in tree.nodes(children).await? {
        by_role.entry(child.role).or_default().push(child.id);
    }
    Ok(by_role)
}
