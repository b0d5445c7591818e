//! Write transactions: copy-on-write edits on top of a committed tree.
//!
//! A [`WriteTransaction`] stages every new record in a [`WriteBuffer`] and
//! records each applied edit as an [`Operation`]. Nothing becomes visible
//! to other readers until [`WriteTransaction::commit`]; dropping an open
//! transaction discards it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use arbor_store::{BulkQuery, ObjectLoader, Record, StoredObject, WriteBuffer};
use arbor_types::{ConceptRef, NodeId, NodeReference, ObjectHash};

use crate::error::{TreeError, TreeResult};
use crate::node::NodeData;
use crate::operation::{subtree_operations, Operation};
use crate::tree::{Tree, TreeData};
use crate::trie::{self, TrieNode};

/// An open write on a tree.
pub struct WriteTransaction {
    base: Tree,
    store: Arc<BulkQuery>,
    buffer: Arc<WriteBuffer>,
    nodes: ObjectHash,
    ops: Vec<Operation>,
    /// Roles of the nodes read or written so far, for sibling positioning.
    roles: HashMap<NodeId, Option<String>>,
}

impl WriteTransaction {
    /// Open a transaction on `base`, which must already be stored.
    pub fn new(base: &Tree, store: Arc<BulkQuery>) -> Self {
        let buffer = Arc::new(WriteBuffer::new(store.clone()));
        Self {
            nodes: *base.nodes_root(),
            base: base.clone(),
            store,
            buffer,
            ops: Vec::new(),
            roles: HashMap::new(),
        }
    }

    pub fn base(&self) -> &Tree {
        &self.base
    }

    /// Operations applied so far, in order.
    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    pub fn store(&self) -> &Arc<BulkQuery> {
        &self.store
    }

    /// Whether any edit has been applied.
    pub fn is_modified(&self) -> bool {
        self.nodes != *self.base.nodes_root()
    }

    fn tree_data(&self) -> TreeData {
        TreeData {
            nodes: self.nodes,
            ..self.base.data().clone()
        }
    }

    /// A snapshot of the current, uncommitted state.
    pub fn snapshot(&self) -> TreeResult<Tree> {
        let data = self.tree_data();
        let hash = self.buffer.stage_record(&data)?;
        Ok(Tree::from_parts(data, hash, self.buffer.clone()))
    }

    // ---------------------------------------------------------------
    // Reads against the current state
    // ---------------------------------------------------------------

    pub async fn get(&self, id: NodeId) -> TreeResult<Option<NodeData>> {
        let Some(hash) = trie::get(&*self.buffer, &self.nodes, id).await? else {
            return Ok(None);
        };
        let loader: &dyn ObjectLoader = &*self.buffer;
        Ok(Some(loader.load_record::<NodeData>(&hash).await?))
    }

    pub async fn node(&self, id: NodeId) -> TreeResult<NodeData> {
        self.get(id).await?.ok_or(TreeError::NodeNotFound(id))
    }

    pub async fn contains(&self, id: NodeId) -> TreeResult<bool> {
        Ok(trie::get(&*self.buffer, &self.nodes, id).await?.is_some())
    }

    /// Load several nodes concurrently; order follows `ids`.
    pub async fn nodes(&self, ids: &[NodeId]) -> TreeResult<Vec<NodeData>> {
        try_join_all(ids.iter().map(|id| self.node(*id))).await
    }

    pub async fn children_in_role(&self, parent: NodeId, role: Option<&str>) -> TreeResult<Vec<NodeId>> {
        let parent = self.node(parent).await?;
        Ok(self
            .nodes(&parent.children)
            .await?
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

    /// Ancestors of `id`, parent first, ending at the root.
    pub async fn ancestors(&self, id: NodeId) -> TreeResult<Vec<NodeId>> {
        let mut result = Vec::new();
        let mut current = self.node(id).await?.parent;
        while let Some(parent) = current {
            if parent == id || result.contains(&parent) {
                return Err(TreeError::Corrupt(format!("containment loop at {parent}")));
            }
            result.push(parent);
            current = self.node(parent).await?.parent;
        }
        Ok(result)
    }

    /// The subtree rooted at `id` (inclusive); parents precede children.
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

    // ---------------------------------------------------------------
    // Record plumbing
    // ---------------------------------------------------------------

    async fn put_node(&mut self, node: &NodeData) -> TreeResult<()> {
        let hash = self.buffer.stage_record(node)?;
        self.nodes = trie::insert(&self.buffer, &self.nodes, node.id, hash).await?;
        self.roles.insert(node.id, node.role.clone());
        Ok(())
    }

    /// Children of `parent` in `role`. Each sibling record is decoded at
    /// most once per transaction.
    async fn role_children(&mut self, parent: &NodeData, role: Option<&str>) -> TreeResult<Vec<NodeId>> {
        let unknown: Vec<NodeId> = parent
            .children
            .iter()
            .filter(|c| !self.roles.contains_key(*c))
            .copied()
            .collect();
        for child in self.nodes(&unknown).await? {
            self.roles.insert(child.id, child.role);
        }
        Ok(parent
            .children
            .iter()
            .filter(|c| self.roles.get(*c).is_some_and(|r| r.as_deref() == role))
            .copied()
            .collect())
    }

    /// Insert `id` into `parent.children` so that it ends up at `index`
    /// within `role`; returns the clamped role-local index.
    async fn place_child(
        &mut self,
        parent: &mut NodeData,
        role: Option<&str>,
        index: Option<usize>,
        id: NodeId,
    ) -> TreeResult<usize> {
        let in_role = self.role_children(parent, role).await?;
        let index = index.unwrap_or(in_role.len()).min(in_role.len());
        let position = if let Some(successor) = in_role.get(index) {
            position_of(&parent.children, *successor)?
        } else if let Some(last) = in_role.last() {
            position_of(&parent.children, *last)? + 1
        } else {
            parent.children.len()
        };
        parent.children.insert(position, id);
        Ok(index)
    }

    // ---------------------------------------------------------------
    // Edits
    // ---------------------------------------------------------------

    /// Create node `id` under `parent` at `index` of `role` (`None` appends).
    pub async fn add_new_child(
        &mut self,
        parent: NodeId,
        role: Option<&str>,
        index: Option<usize>,
        id: NodeId,
        concept: Option<ConceptRef>,
    ) -> TreeResult<NodeId> {
        if self.contains(id).await? {
            return Err(TreeError::NodeAlreadyExists(id));
        }
        let mut parent_node = self.node(parent).await?;
        let index = self.place_child(&mut parent_node, role, index, id).await?;
        self.put_node(&parent_node).await?;
        let child = NodeData::new(id, concept.clone(), Some(parent), role.map(str::to_owned));
        self.put_node(&child).await?;
        self.ops.push(Operation::AddChild {
            parent,
            role: role.map(str::to_owned),
            index,
            id,
            concept,
        });
        Ok(id)
    }

    /// Move `id` to `index` of `role` under `parent` (`None` appends).
    ///
    /// Fails with [`TreeError::ContainmentCycle`] before touching anything
    /// if `parent` is `id` or one of its descendants.
    pub async fn move_child(
        &mut self,
        parent: NodeId,
        role: Option<&str>,
        index: Option<usize>,
        id: NodeId,
    ) -> TreeResult<()> {
        if id.is_root() {
            return Err(TreeError::RootNotRemovable);
        }
        let node = self.node(id).await?;
        self.node(parent).await?;
        if parent == id || self.ancestors(parent).await?.contains(&id) {
            return Err(TreeError::ContainmentCycle {
                node: id,
                new_parent: parent,
            });
        }

        if let Some(old_parent) = node.parent {
            let mut old = self.node(old_parent).await?;
            old.children.retain(|c| *c != id);
            self.put_node(&old).await?;
        }
        let mut new_parent = self.node(parent).await?;
        let index = self.place_child(&mut new_parent, role, index, id).await?;
        self.put_node(&new_parent).await?;

        let moved = NodeData {
            parent: Some(parent),
            role: role.map(str::to_owned),
            ..node
        };
        self.put_node(&moved).await?;
        self.ops.push(Operation::MoveChild {
            parent,
            role: role.map(str::to_owned),
            index,
            id,
        });
        Ok(())
    }

    /// Delete `id` and its whole subtree, leaves first.
    pub async fn delete_node(&mut self, id: NodeId) -> TreeResult<()> {
        if id.is_root() {
            return Err(TreeError::RootNotRemovable);
        }
        let subtree = self.load_subtree(id).await?;
        for node in subtree.iter().rev() {
            self.delete_single(node.id).await?;
        }
        Ok(())
    }

    /// Delete one childless node.
    async fn delete_single(&mut self, id: NodeId) -> TreeResult<()> {
        if id.is_root() {
            return Err(TreeError::RootNotRemovable);
        }
        let node = self.node(id).await?;
        if node.has_children() {
            return Err(TreeError::NotEmpty(id));
        }
        if let Some(parent) = node.parent {
            let mut parent_node = self.node(parent).await?;
            parent_node.children.retain(|c| *c != id);
            self.put_node(&parent_node).await?;
        }
        self.nodes = trie::remove(&self.buffer, &self.nodes, id).await?;
        self.roles.remove(&id);
        self.ops.push(Operation::DeleteNode { id });
        Ok(())
    }

    /// Set or clear a property. Writing the current value records nothing.
    pub async fn set_property(&mut self, id: NodeId, role: &str, value: Option<String>) -> TreeResult<()> {
        let node = self.node(id).await?;
        if node.properties.get(role) == value.as_ref() {
            return Ok(());
        }
        self.put_node(&node.with_property(role, value.clone())).await?;
        self.ops.push(Operation::SetProperty {
            id,
            role: role.to_owned(),
            value,
        });
        Ok(())
    }

    /// Set or clear a reference. Writing the current target records nothing.
    pub async fn set_reference(
        &mut self,
        id: NodeId,
        role: &str,
        target: Option<NodeReference>,
    ) -> TreeResult<()> {
        let node = self.node(id).await?;
        if node.references.get(role) == target.as_ref() {
            return Ok(());
        }
        self.put_node(&node.with_reference(role, target.clone())).await?;
        self.ops.push(Operation::SetReference {
            id,
            role: role.to_owned(),
            target,
        });
        Ok(())
    }

    pub async fn set_concept(&mut self, id: NodeId, concept: Option<ConceptRef>) -> TreeResult<()> {
        let node = self.node(id).await?;
        if node.concept == concept {
            return Ok(());
        }
        self.put_node(&NodeData {
            concept: concept.clone(),
            ..node
        })
        .await?;
        self.ops.push(Operation::SetConcept { id, concept });
        Ok(())
    }

    /// Copy the subtree of `source` rooted at `root` under `parent`.
    pub async fn add_subtree(
        &mut self,
        source: &Tree,
        root: NodeId,
        parent: NodeId,
        role: Option<&str>,
        index: Option<usize>,
    ) -> TreeResult<()> {
        let index = match index {
            Some(i) => i,
            None => self.children_in_role(parent, role).await?.len(),
        };
        let ops = subtree_operations(source, root, parent, role.map(str::to_owned), index).await?;
        for op in &ops {
            self.apply_edit(op).await?;
        }
        Ok(())
    }

    /// Apply a recorded operation.
    ///
    /// History operations (`Undo`, `Revert`) and `NoOp` leave the tree
    /// unchanged; a `BulkSubtreeAdd` is applied as the fine-grained
    /// operations it stands for.
    pub async fn apply(&mut self, op: &Operation) -> TreeResult<()> {
        let Operation::BulkSubtreeAdd { source_tree, parent, role, index, root, .. } = op else {
            return self.apply_edit(op).await;
        };
        let loader: Arc<dyn ObjectLoader> = self.store.clone();
        let source = Tree::load(loader, source_tree).await?;
        let ops = subtree_operations(&source, *root, *parent, role.clone(), *index).await?;
        for op in &ops {
            self.apply_edit(op).await?;
        }
        Ok(())
    }

    async fn apply_edit(&mut self, op: &Operation) -> TreeResult<()> {
        match op {
            Operation::AddChild { parent, role, index, id, concept } => {
                self.add_new_child(*parent, role.as_deref(), Some(*index), *id, concept.clone())
                    .await?;
            }
            Operation::DeleteNode { id } => self.delete_single(*id).await?,
            Operation::MoveChild { parent, role, index, id } => {
                self.move_child(*parent, role.as_deref(), Some(*index), *id).await?;
            }
            Operation::SetProperty { id, role, value } => {
                self.set_property(*id, role, value.clone()).await?;
            }
            Operation::SetReference { id, role, target } => {
                self.set_reference(*id, role, target.clone()).await?;
            }
            Operation::SetConcept { id, concept } => self.set_concept(*id, concept.clone()).await?,
            Operation::BulkSubtreeAdd { root, .. } => {
                return Err(TreeError::Corrupt(format!("nested bulk add of {root}")));
            }
            Operation::Revert { .. } | Operation::Undo { .. } | Operation::NoOp => {}
        }
        Ok(())
    }

    /// Write every record reachable from the new tree and return it with
    /// the applied operations.
    pub async fn commit(self) -> TreeResult<(Tree, Vec<Operation>)> {
        let data = self.tree_data();
        let tree_obj = data.to_stored_object()?;
        let hash = tree_obj.compute_hash();

        let mut objects = self.reachable_staged().await?;
        objects.push(tree_obj);
        debug!(
            tree = %hash.short_hex(),
            objects = objects.len(),
            operations = self.ops.len(),
            "committing write transaction"
        );
        self.store.put_all(objects).await?;

        let loader: Arc<dyn ObjectLoader> = self.store.clone();
        Ok((Tree::from_parts(data, hash, loader), self.ops))
    }

    /// Staged objects reachable from the current trie root.
    ///
    /// Anything not staged is part of the committed base and already
    /// stored, so the walk stops there.
    async fn reachable_staged(&self) -> TreeResult<Vec<StoredObject>> {
        let mut found: HashMap<ObjectHash, StoredObject> = HashMap::new();
        let mut pending = vec![self.nodes];
        while let Some(hash) = pending.pop() {
            if found.contains_key(&hash) {
                continue;
            }
            let Some(obj) = self.buffer.staged(&hash) else {
                continue;
            };
            match TrieNode::from_stored_object(&obj)? {
                TrieNode::Internal { children, .. } => pending.extend(children),
                TrieNode::Leaf { value, .. } => {
                    if let Some(node) = self.buffer.staged(&value) {
                        found.insert(value, node);
                    }
                }
            }
            found.insert(hash, obj);
        }
        Ok(found.into_values().collect())
    }
}

fn position_of(children: &[NodeId], id: NodeId) -> TreeResult<usize> {
    children
        .iter()
        .position(|c| *c == id)
        .ok_or_else(|| TreeError::Corrupt(format!("{id} missing from its parent's children")))
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("base", &self.base.hash().short_hex())
            .field("operations", &self.ops.len())
            .finish()
    }
}
