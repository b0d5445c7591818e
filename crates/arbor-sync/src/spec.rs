//! The JSON model specification format.
//!
//! A specification describes the desired state of a model as a plain tree:
//!
//! ```json
//! { "id": "root", "children": [
//!     { "id": "c1", "concept": "lang.Class", "role": "classes",
//!       "properties": { "name": "Main" },
//!       "references": { "super": "c0" } } ] }
//! ```
//!
//! Every field is optional. Node ids are external identities; references
//! name the id of their target node.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use arbor_tree::{NodeData, Tree};
use arbor_types::{ConceptRef, NodeId, NodeReference, RepositoryId};

use crate::error::SyncResult;

/// Property that stores a node's external identity in the target tree.
pub const ORIGINAL_ID_PROPERTY: &str = "#originalId#";

/// One node of a model specification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept: Option<ConceptRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The external identity: an explicit original-id property wins over `id`.
    pub fn original_id(&self) -> Option<&str> {
        self.properties
            .get(ORIGINAL_ID_PROPERTY)
            .map(String::as_str)
            .or(self.id.as_deref())
    }

    /// Number of nodes in this subtree, including itself.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(NodeSpec::node_count).sum::<usize>()
    }

    /// Export the subtree of `tree` below `id` as a specification.
    ///
    /// Node ids are the nodes' original ids; references name the original
    /// id of their target.
    pub async fn export(tree: &Tree, id: NodeId) -> SyncResult<Self> {
        let nodes: HashMap<NodeId, NodeData> = tree
            .load_subtree(id)
            .await?
            .into_iter()
            .map(|n| (n.id, n))
            .collect();

        let mut targets = HashMap::new();
        for node in nodes.values() {
            for reference in node.references.values() {
                let key = match reference {
                    NodeReference::Local(target) => match nodes.get(target) {
                        Some(data) => original_id(data, tree.repository()),
                        None => match tree.get(*target).await? {
                            Some(data) => original_id(&data, tree.repository()),
                            None => reference.to_string(),
                        },
                    },
                    other => other.to_string(),
                };
                targets.insert(reference.clone(), key);
            }
        }

        Ok(Self::build(&nodes, &targets, id, tree.repository()))
    }

    fn build(
        nodes: &HashMap<NodeId, NodeData>,
        targets: &HashMap<NodeReference, String>,
        id: NodeId,
        repository: &RepositoryId,
    ) -> Self {
        let Some(node) = nodes.get(&id) else {
            return Self::default();
        };
        Self {
            id: Some(original_id(node, repository)),
            concept: node.concept.clone(),
            role: node.role.clone(),
            properties: node
                .properties
                .iter()
                .filter(|(role, _)| role.as_str() != ORIGINAL_ID_PROPERTY)
                .map(|(role, value)| (role.clone(), value.clone()))
                .collect(),
            references: node
                .references
                .iter()
                .filter_map(|(role, r)| targets.get(r).map(|key| (role.clone(), key.clone())))
                .collect(),
            children: node
                .children
                .iter()
                .map(|child| Self::build(nodes, targets, *child, repository))
                .collect(),
        }
    }
}

/// A complete model specification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub root: NodeSpec,
}

impl ModelSpec {
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The external identity of a stored node: its original-id property, or
/// else its global reference.
pub fn original_id(node: &NodeData, repository: &RepositoryId) -> String {
    match node.property(ORIGINAL_ID_PROPERTY) {
        Some(id) => id.to_owned(),
        None => NodeReference::Global {
            repository: repository.clone(),
            node: node.id,
        }
        .to_string(),
    }
}
