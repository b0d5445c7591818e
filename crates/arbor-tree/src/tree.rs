//! Immutable tree snapshots.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use arbor_store::{BulkQuery, ObjectKind, ObjectLoader, Record};
use arbor_types::{ConceptRef, NodeId, NodeReference, ObjectHash, RepositoryId};

use crate::error::{TreeError, TreeResult};
use crate::node::NodeData;
use crate::trie::{self, TrieNode};

/// Role under the root node that holds nodes detached by merge conflicts.
pub const DETACHED_ROLE: &str = "detached";

/// The stored form of a tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeData {
    pub repository: RepositoryId,
    /// Root of the node-id -> node-record hash trie.
    pub nodes: ObjectHash,
}

impl Record for TreeData {
    const KIND: ObjectKind = ObjectKind::Tree;
}

/// A read-only snapshot of a tree.
///
/// Snapshots are cheap to clone and safe to read concurrently; every read
/// goes through the loader, which batches and caches lookups. Two trees are
/// equal when their hashes are.
#[derive(Clone)]
pub struct Tree {
    data: TreeData,
    hash: ObjectHash,
    loader: Arc<dyn ObjectLoader>,
}

impl Tree {
    pub(crate) fn from_parts(data: TreeData, hash: ObjectHash, loader: Arc<dyn ObjectLoader>) -> Self {
        Self { data, hash, loader }
    }

    /// Load the tree stored under `hash`.
    pub async fn load(loader: Arc<dyn ObjectLoader>, hash: &ObjectHash) -> TreeResult<Self> {
        let data = loader.load_record::<TreeData>(hash).await?;
        Ok(Self::from_parts(data, *hash, loader))
    }

    /// Write a tree holding only the root node and return it.
    pub async fn create_empty(repository: RepositoryId, store: &Arc<BulkQuery>) -> TreeResult<Self> {
        let root = NodeData::root().to_stored_object()?;
        let leaf = TrieNode::Leaf {
            key: NodeId::ROOT,
            value: root.compute_hash(),
        }
        .to_stored_object()?;
        let trie = TrieNode::Internal {
            bitmap: 1 << (NodeId::ROOT.as_u64() & 0x3f),
            children: vec![leaf.compute_hash()],
        }
        .to_stored_object()?;
        let data = TreeData {
            repository,
            nodes: trie.compute_hash(),
        };
        let tree_obj = data.to_stored_object()?;
        let hash = tree_obj.compute_hash();
        store.put_all(vec![root, leaf, trie, tree_obj]).await?;
        Ok(Self::from_parts(data, hash, store.clone()))
    }

    pub fn hash(&self) -> ObjectHash {
        self.hash
    }

    pub fn repository(&self) -> &RepositoryId {
        &self.data.repository
    }

    pub fn data(&self) -> &TreeData {
        &self.data
    }

    pub fn nodes_root(&self) -> &ObjectHash {
        &self.data.nodes
    }

    pub fn loader(&self) -> &Arc<dyn ObjectLoader> {
        &self.loader
    }

    /// The same snapshot, read through another loader.
    pub fn with_loader(&self, loader: Arc<dyn ObjectLoader>) -> Self {
        Self::from_parts(self.data.clone(), self.hash, loader)
    }

    // ---------------------------------------------------------------
    // Node lookup
    // ---------------------------------------------------------------

    pub async fn get(&self, id: NodeId) -> TreeResult<Option<NodeData>> {
        let Some(hash) = trie::get(self.loader.as_ref(), &self.data.nodes, id).await? else {
            return Ok(None);
        };
        Ok(Some(self.loader.load_record::<NodeData>(&hash).await?))
    }

    /// Like [`Tree::get`], but a missing node is an error.
    pub async fn node(&self, id: NodeId) -> TreeResult<NodeData> {
        self.get(id).await?.ok_or(TreeError::NodeNotFound(id))
    }

    /// Load several nodes concurrently; order follows `ids`.
    pub async fn nodes(&self, ids: &[NodeId]) -> TreeResult<Vec<NodeData>> {
        try_join_all(ids.iter().map(|id| self.node(*id))).await
    }

    pub async fn contains(&self, id: NodeId) -> TreeResult<bool> {
        Ok(trie::get(self.loader.as_ref(), &self.data.nodes, id)
            .await?
            .is_some())
    }

    /// Hash of the record stored for `id`.
    pub async fn node_hash(&self, id: NodeId) -> TreeResult<Option<ObjectHash>> {
        trie::get(self.loader.as_ref(), &self.data.nodes, id).await
    }

    /// Every node id with its record hash, sorted by id.
    pub async fn node_entries(&self) -> TreeResult<Vec<(NodeId, ObjectHash)>> {
        trie::entries(self.loader.as_ref(), &self.data.nodes).await
    }

    // ---------------------------------------------------------------
    // Structure
    // ---------------------------------------------------------------

    /// All children in storage order.
    pub async fn children(&self, id: NodeId) -> TreeResult<Vec<NodeId>> {
        Ok(self.node(id).await?.children)
    }

    /// Children in `role`, in role order.
    pub async fn children_in_role(&self, id: NodeId, role: Option<&str>) -> TreeResult<Vec<NodeId>> {
        let parent = self.node(id).await?;
        let children = self.nodes(&parent.children).await?;
        Ok(children
            .into_iter()
            .filter(|child| child.role.as_deref() == role)
            .map(|child| child.id)
            .collect())
    }

    /// Distinct roles of the children, in order of first appearance.
    pub async fn roles_of_children(&self, id: NodeId) -> TreeResult<Vec<Option<String>>> {
        let parent = self.node(id).await?;
        let mut roles: Vec<Option<String>> = Vec::new();
        for child in self.nodes(&parent.children).await? {
            if !roles.contains(&child.role) {
                roles.push(child.role);
            }
        }
        Ok(roles)
    }

    pub async fn parent(&self, id: NodeId) -> TreeResult<Option<NodeId>> {
        Ok(self.node(id).await?.parent)
    }

    pub async fn role(&self, id: NodeId) -> TreeResult<Option<String>> {
        Ok(self.node(id).await?.role)
    }

    pub async fn concept(&self, id: NodeId) -> TreeResult<Option<ConceptRef>> {
        Ok(self.node(id).await?.concept)
    }

    pub async fn property(&self, id: NodeId, role: &str) -> TreeResult<Option<String>> {
        Ok(self.node(id).await?.properties.remove(role))
    }

    pub async fn reference(&self, id: NodeId, role: &str) -> TreeResult<Option<NodeReference>> {
        Ok(self.node(id).await?.references.remove(role))
    }

    /// Ancestors of `id`, parent first, ending at the root.
    pub async fn ancestors(&self, id: NodeId) -> TreeResult<Vec<NodeId>> {
        let mut result = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut current = self.node(id).await?.parent;
        while let Some(parent) = current {
            if !seen.insert(parent) {
                return Err(TreeError::Corrupt(format!("containment loop at {parent}")));
            }
            result.push(parent);
            current = self.node(parent).await?.parent;
        }
        Ok(result)
    }

    /// Whether `ancestor` is `id` itself or one of its ancestors.
    pub async fn is_ancestor_or_self(&self, ancestor: NodeId, id: NodeId) -> TreeResult<bool> {
        if ancestor == id {
            return Ok(true);
        }
        Ok(self.ancestors(id).await?.contains(&ancestor))
    }

    /// Lazily enumerate the subtree below `id` in depth-first pre-order.
    pub fn descendants(
        &self,
        id: NodeId,
        include_self: bool,
    ) -> impl Stream<Item = TreeResult<NodeData>> + Send + '_ {
        stream::try_unfold((vec![id], include_self), move |(mut stack, mut emit)| async move {
            while let Some(next) = stack.pop() {
                let node = self.node(next).await?;
                stack.extend(node.children.iter().rev().copied());
                if emit {
                    return Ok(Some((node, (stack, true))));
                }
                emit = true;
            }
            Ok(None)
        })
    }

    /// The subtree rooted at `id` (inclusive), loaded level by level.
    ///
    /// Parents always precede their children in the result.
    pub async fn load_subtree(&self, id: NodeId) -> TreeResult<Vec<NodeData>> {
        let mut result = Vec::new();
        let mut level = vec![id];
        while !level.is_empty() {
            let nodes = self.nodes(&level).await?;
            level = nodes.iter().flat_map(|n| n.children.iter().copied()).collect();
            result.extend(nodes);
        }
        Ok(result)
    }
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Tree {}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("hash", &self.hash.short_hex())
            .field("repository", &self.data.repository)
            .finish()
    }
}
