//! The closed set of tree edit operations.

use std::fmt;

use serde::{Deserialize, Serialize};

use arbor_types::{ConceptRef, NodeId, NodeReference, ObjectHash};

use crate::error::TreeResult;
use crate::tree::Tree;

/// One recorded edit.
///
/// Positions are role-local final positions: after an `AddChild` or
/// `MoveChild` the node sits at `index` within the children of `parent`
/// that carry `role`. A `DeleteNode` removes a single childless node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    AddChild {
        parent: NodeId,
        role: Option<String>,
        index: usize,
        id: NodeId,
        concept: Option<ConceptRef>,
    },
    DeleteNode {
        id: NodeId,
    },
    MoveChild {
        parent: NodeId,
        role: Option<String>,
        index: usize,
        id: NodeId,
    },
    SetProperty {
        id: NodeId,
        role: String,
        value: Option<String>,
    },
    SetReference {
        id: NodeId,
        role: String,
        target: Option<NodeReference>,
    },
    SetConcept {
        id: NodeId,
        concept: Option<ConceptRef>,
    },
    /// A whole subtree copied from `source_tree`, where it is rooted at `root`.
    BulkSubtreeAdd {
        source_tree: ObjectHash,
        parent: NodeId,
        role: Option<String>,
        index: usize,
        root: NodeId,
        concept: Option<ConceptRef>,
    },
    /// Roll back every change made after `revert_to` up to `latest_known`.
    Revert {
        latest_known: ObjectHash,
        revert_to: ObjectHash,
    },
    /// Cancel the changes of `version`.
    Undo {
        version: ObjectHash,
    },
    NoOp,
}

impl Operation {
    /// The node this operation edits, if it edits one.
    pub fn target(&self) -> Option<NodeId> {
        match self {
            Self::AddChild { id, .. }
            | Self::DeleteNode { id }
            | Self::MoveChild { id, .. }
            | Self::SetProperty { id, .. }
            | Self::SetReference { id, .. }
            | Self::SetConcept { id, .. } => Some(*id),
            Self::BulkSubtreeAdd { root, .. } => Some(*root),
            Self::Revert { .. } | Self::Undo { .. } | Self::NoOp => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    /// Whether this operation acts on history rather than on the tree.
    pub fn is_history_op(&self) -> bool {
        matches!(self, Self::Revert { .. } | Self::Undo { .. })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddChild { parent, role, index, id, .. } => {
                write!(f, "add {id} to {parent}.{}[{index}]", role.as_deref().unwrap_or("_"))
            }
            Self::DeleteNode { id } => write!(f, "delete {id}"),
            Self::MoveChild { parent, role, index, id } => {
                write!(f, "move {id} to {parent}.{}[{index}]", role.as_deref().unwrap_or("_"))
            }
            Self::SetProperty { id, role, value } => match value {
                Some(v) => write!(f, "set {id}.{role} = {v:?}"),
                None => write!(f, "unset {id}.{role}"),
            },
            Self::SetReference { id, role, target } => match target {
                Some(t) => write!(f, "ref {id}.{role} -> {t}"),
                None => write!(f, "unref {id}.{role}"),
            },
            Self::SetConcept { id, concept } => match concept {
                Some(c) => write!(f, "concept {id} = {c}"),
                None => write!(f, "concept {id} = none"),
            },
            Self::BulkSubtreeAdd { parent, root, source_tree, .. } => {
                write!(f, "bulk add {root} to {parent} from {}", source_tree.short_hex())
            }
            Self::Revert { latest_known, revert_to } => write!(
                f,
                "revert {} to {}",
                latest_known.short_hex(),
                revert_to.short_hex()
            ),
            Self::Undo { version } => write!(f, "undo {}", version.short_hex()),
            Self::NoOp => write!(f, "noop"),
        }
    }
}

/// The fine-grained operations that recreate the subtree of `source` rooted
/// at `root` under `parent`.
///
/// The first operation adds the subtree root at `index` of `role`; every
/// other node is appended to its parent's role in source order, followed by
/// its properties and references.
pub async fn subtree_operations(
    source: &Tree,
    root: NodeId,
    parent: NodeId,
    role: Option<String>,
    index: usize,
) -> TreeResult<Vec<Operation>> {
    let nodes = source.load_subtree(root).await?;
    let mut ops = Vec::with_capacity(nodes.len() * 2);
    let mut next_index: std::collections::HashMap<(NodeId, Option<String>), usize> =
        std::collections::HashMap::new();

    for node in nodes {
        if node.id == root {
            ops.push(Operation::AddChild {
                parent,
                role: role.clone(),
                index,
                id: node.id,
                concept: node.concept.clone(),
            });
        } else {
            let node_parent = node.parent.unwrap_or(root);
            let slot = next_index.entry((node_parent, node.role.clone())).or_insert(0);
            ops.push(Operation::AddChild {
                parent: node_parent,
                role: node.role.clone(),
                index: *slot,
                id: node.id,
                concept: node.concept.clone(),
            });
            *slot += 1;
        }
        for (prop, value) in &node.properties {
            ops.push(Operation::SetProperty {
                id: node.id,
                role: prop.clone(),
                value: Some(value.clone()),
            });
        }
        for (ref_role, target) in &node.references {
            ops.push(Operation::SetReference {
                id: node.id,
                role: ref_role.clone(),
                target: Some(target.clone()),
            });
        }
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_form_is_tagged() {
        let op = Operation::DeleteNode { id: NodeId::new(0x2a) };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"op":"delete_node","id":42}"#);
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn targets() {
        let set = Operation::SetProperty {
            id: NodeId::new(5),
            role: "name".into(),
            value: None,
        };
        assert_eq!(set.target(), Some(NodeId::new(5)));
        assert_eq!(Operation::NoOp.target(), None);
        let undo = Operation::Undo { version: ObjectHash::null() };
        assert!(undo.is_history_op());
        assert!(!set.is_history_op());
    }

    #[test]
    fn display() {
        let op = Operation::MoveChild {
            parent: NodeId::ROOT,
            role: Some("items".into()),
            index: 2,
            id: NodeId::new(0xff),
        };
        assert_eq!(op.to_string(), "move ff to 1.items[2]");
        assert_eq!(Operation::NoOp.to_string(), "noop");
    }
}
