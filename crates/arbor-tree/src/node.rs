//! The immutable node record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use arbor_store::{ObjectKind, Record};
use arbor_types::{ConceptRef, NodeId, NodeReference};

/// One node of a tree, as stored.
///
/// `children` is the storage order of all children across roles; the order
/// within a role is the subsequence of children carrying that role. Maps are
/// `BTreeMap`s so the serialization, and with it the hash, is canonical.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<ConceptRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, NodeReference>,
}

impl Record for NodeData {
    const KIND: ObjectKind = ObjectKind::Node;
}

impl NodeData {
    /// A fresh node with no children, properties or references.
    pub fn new(
        id: NodeId,
        concept: Option<ConceptRef>,
        parent: Option<NodeId>,
        role: Option<String>,
    ) -> Self {
        Self {
            id,
            concept,
            parent,
            role,
            children: Vec::new(),
            properties: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }

    /// The root record of an empty tree.
    pub fn root() -> Self {
        Self::new(NodeId::ROOT, None, None, None)
    }

    pub fn property(&self, role: &str) -> Option<&str> {
        self.properties.get(role).map(String::as_str)
    }

    pub fn reference(&self, role: &str) -> Option<&NodeReference> {
        self.references.get(role)
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Returns a copy with `value` set (or cleared) under `role`.
    pub fn with_property(&self, role: &str, value: Option<String>) -> Self {
        let mut next = self.clone();
        match value {
            Some(v) => {
                next.properties.insert(role.to_owned(), v);
            }
            None => {
                next.properties.remove(role);
            }
        }
        next
    }

    /// Returns a copy with `target` set (or cleared) under `role`.
    pub fn with_reference(&self, role: &str, target: Option<NodeReference>) -> Self {
        let mut next = self.clone();
        match target {
            Some(t) => {
                next.references.insert(role.to_owned(), t);
            }
            None => {
                next.references.remove(role);
            }
        }
        next
    }
}
