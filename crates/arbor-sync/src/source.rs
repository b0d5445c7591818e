//! Sources a synchronization reads the desired state from.

use std::collections::BTreeMap;

use async_trait::async_trait;

use arbor_tree::{NodeData, Tree};
use arbor_types::{ConceptRef, NodeId, NodeReference};

use crate::error::SyncResult;
use crate::spec::{original_id, NodeSpec, ORIGINAL_ID_PROPERTY};

/// The desired state of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceNode {
    /// Identity within the source; the root of every source is
    /// [`NodeId::ROOT`]. Invalidation paths are built from handles.
    pub handle: NodeId,
    /// External identity; `None` for nodes matched by position.
    pub original_id: Option<String>,
    pub concept: Option<ConceptRef>,
    pub role: Option<String>,
    /// Properties without the original-id property.
    pub properties: BTreeMap<String, String>,
    /// Reference role to the original id of the target.
    pub references: BTreeMap<String, String>,
}

/// A tree of desired node states, read lazily.
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn root(&self) -> SyncResult<SourceNode>;

    /// Children of `node`, in order.
    async fn children(&self, node: &SourceNode) -> SyncResult<Vec<SourceNode>>;

    /// Number of nodes, when known without walking the source.
    fn size_hint(&self) -> Option<usize> {
        None
    }
}

/// A source over an in-memory [`NodeSpec`].
///
/// Nodes are numbered in pre-order; the handle of the root is
/// [`NodeId::ROOT`].
#[derive(Clone, Debug)]
pub struct SpecSource {
    nodes: Vec<SourceNode>,
    children: Vec<Vec<usize>>,
}

impl SpecSource {
    pub fn new(spec: &NodeSpec) -> Self {
        let mut source = Self {
            nodes: Vec::with_capacity(spec.node_count()),
            children: Vec::with_capacity(spec.node_count()),
        };
        source.flatten(spec);
        source
    }

    fn flatten(&mut self, spec: &NodeSpec) -> usize {
        let index = self.nodes.len();
        self.nodes.push(SourceNode {
            handle: NodeId::new(index as u64 + NodeId::ROOT.as_u64()),
            original_id: spec.original_id().map(str::to_owned),
            concept: spec.concept.clone(),
            role: spec.role.clone(),
            properties: spec
                .properties
                .iter()
                .filter(|(role, _)| role.as_str() != ORIGINAL_ID_PROPERTY)
                .map(|(role, value)| (role.clone(), value.clone()))
                .collect(),
            references: spec.references.clone(),
        });
        self.children.push(Vec::new());
        for child in &spec.children {
            let child_index = self.flatten(child);
            self.children[index].push(child_index);
        }
        index
    }

    fn index_of(handle: NodeId) -> usize {
        (handle.as_u64() - NodeId::ROOT.as_u64()) as usize
    }
}

#[async_trait]
impl SyncSource for SpecSource {
    async fn root(&self) -> SyncResult<SourceNode> {
        Ok(self.nodes[0].clone())
    }

    async fn children(&self, node: &SourceNode) -> SyncResult<Vec<SourceNode>> {
        let children = self
            .children
            .get(Self::index_of(node.handle))
            .map(|c| c.iter().map(|i| self.nodes[*i].clone()).collect())
            .unwrap_or_default();
        Ok(children)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.nodes.len())
    }
}

/// A source over a stored tree snapshot.
///
/// Nodes without an original-id property are identified by their global
/// reference, so a tree can be mirrored into another repository.
#[derive(Clone, Debug)]
pub struct TreeSource {
    tree: Tree,
}

impl TreeSource {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    async fn to_source(&self, node: NodeData) -> SyncResult<SourceNode> {
        let mut references = BTreeMap::new();
        for (role, reference) in &node.references {
            let target = match reference {
                NodeReference::Local(target) => match self.tree.get(*target).await? {
                    Some(data) => original_id(&data, self.tree.repository()),
                    None => reference.to_string(),
                },
                other => other.to_string(),
            };
            references.insert(role.clone(), target);
        }
        Ok(SourceNode {
            handle: node.id,
            original_id: Some(original_id(&node, self.tree.repository())),
            properties: node
                .properties
                .iter()
                .filter(|(role, _)| role.as_str() != ORIGINAL_ID_PROPERTY)
                .map(|(role, value)| (role.clone(), value.clone()))
                .collect(),
            concept: node.concept,
            role: node.role,
            references,
        })
    }
}

#[async_trait]
impl SyncSource for TreeSource {
    async fn root(&self) -> SyncResult<SourceNode> {
        let root = self.tree.node(NodeId::ROOT).await?;
        self.to_source(root).await
    }

    async fn children(&self, node: &SourceNode) -> SyncResult<Vec<SourceNode>> {
        let ids = self.tree.children(node.handle).await?;
        let mut children = Vec::with_capacity(ids.len());
        for child in self.tree.nodes(&ids).await? {
            children.push(self.to_source(child).await?);
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spec_source_numbers_nodes_in_pre_order() {
        let spec = NodeSpec::from_json(
            r##"{"id": "r", "children": [
                {"id": "a", "children": [{"id": "a1"}]},
                {"properties": {"#originalId#": "b", "name": "B"}}
            ]}"##,
        )
        .unwrap();
        let source = SpecSource::new(&spec);
        let root = source.root().await.unwrap();
        assert_eq!(root.handle, NodeId::ROOT);
        assert_eq!(source.size_hint(), Some(4));

        let children = source.children(&root).await.unwrap();
        let ids: Vec<_> = children.iter().map(|c| c.original_id.as_deref()).collect();
        assert_eq!(ids, vec![Some("a"), Some("b")]);
        assert_eq!(children[0].handle, NodeId::new(2));
        assert_eq!(children[1].handle, NodeId::new(4));
        assert_eq!(children[1].properties.len(), 1);

        let grandchildren = source.children(&children[0]).await.unwrap();
        assert_eq!(grandchildren[0].original_id.as_deref(), Some("a1"));
        assert!(source.children(&grandchildren[0]).await.unwrap().is_empty());
    }
}
