//! Bringing a target tree into the state described by a [`SyncSource`].
//!
//! The source and the target are walked together, top-down. Nodes are
//! matched by external identity (the [`ORIGINAL_ID_PROPERTY`] of target
//! nodes), nodes without one by their position among the id-less children
//! of a role. For every matched node the concept, properties, references
//! and children are brought in line with the source, emitting as few
//! operations as possible:
//!
//! - Ordered roles keep a longest common subsequence of the current order
//!   and move only the remaining children, each right after its desired
//!   predecessor.
//! - Unordered roles only change membership; new or reparented children are
//!   appended.
//! - Deletions are deferred to the end of the walk, so that nodes moved out
//!   of a deleted subtree survive.
//! - References are resolved after the walk, when every node exists.
//!
//! Target nodes are looked up by original id among the children the walk
//! has already read. Only an id that is not found there (a new or moved
//! source node, or a changed reference) makes the walk index the whole
//! target subtree, once. A filtered synchronization of a few changed
//! properties therefore reads only the paths it visits.
//!
//! All edits go into the caller's [`WriteTransaction`]; nothing is visible
//! until the caller commits it.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use similar::{capture_diff_slices, Algorithm, DiffOp};
use tracing::{debug, info, warn};

use arbor_tree::{Operation, WriteTransaction};
use arbor_types::{ConceptRef, IdGenerator, NodeId, NodeReference};

use crate::error::SyncResult;
use crate::invalidation::{AllNodes, SyncFilter};
use crate::schema::{OpenSchema, RoleOrdering, Schema};
use crate::source::{SourceNode, SyncSource};
use crate::spec::ORIGINAL_ID_PROPERTY;

/// What a synchronization changed, and what it could not resolve.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub deleted: usize,
    pub moved: usize,
    /// Property changes, not counting original-id bookkeeping.
    pub properties_changed: usize,
    pub references_changed: usize,
    pub concepts_changed: usize,
    /// Original ids written to target nodes.
    pub ids_assigned: usize,
    /// References stored in serialized form because no node has their id.
    pub unresolved_references: usize,
    /// Source nodes with a concept the schema does not know.
    pub unresolved_concepts: usize,
    /// Roles the schema does not declare; synchronized as ordered.
    pub unresolved_roles: usize,
    /// Subtrees the filter allowed to skip.
    pub skipped_subtrees: usize,
    /// Source nodes visited only for descent that had no target node.
    pub unmatched: usize,
}

impl SyncReport {
    /// Total number of emitted edits.
    pub fn changes(&self) -> usize {
        self.added
            + self.deleted
            + self.moved
            + self.properties_changed
            + self.references_changed
            + self.concepts_changed
            + self.ids_assigned
    }

    pub fn is_unchanged(&self) -> bool {
        self.changes() == 0
    }

    fn record(&mut self, ops: &[Operation]) {
        for op in ops {
            match op {
                Operation::AddChild { .. } => self.added += 1,
                Operation::DeleteNode { .. } => self.deleted += 1,
                Operation::MoveChild { .. } => self.moved += 1,
                Operation::SetProperty { role, .. } if role == ORIGINAL_ID_PROPERTY => self.ids_assigned += 1,
                Operation::SetProperty { .. } => self.properties_changed += 1,
                Operation::SetReference { .. } => self.references_changed += 1,
                Operation::SetConcept { .. } => self.concepts_changed += 1,
                _ => {}
            }
        }
    }
}

/// Identity of a child within its role.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum ChildKey {
    Id(String),
    /// Ordinal among the id-less children of the role.
    Position(usize),
}

#[derive(Debug)]
struct Placed {
    source: SourceNode,
    target: NodeId,
    created: bool,
}

#[derive(Debug)]
struct Visit {
    source: SourceNode,
    target: NodeId,
    path: Vec<NodeId>,
    forced: bool,
}

#[derive(Debug)]
struct PendingReference {
    node: NodeId,
    role: String,
    target: String,
}

#[derive(Debug)]
struct Walk {
    /// Root of the synchronized target subtree.
    scope: NodeId,
    /// Original id to target node, for the nodes read so far.
    index: HashMap<String, NodeId>,
    /// Whether `index` covers the whole target subtree.
    indexed: bool,
    /// Target nodes already matched in this walk; they are never moved again.
    placed: HashSet<NodeId>,
    removals: Vec<NodeId>,
    doomed: HashSet<NodeId>,
    pending: Vec<PendingReference>,
    report: SyncReport,
}

impl Walk {
    fn new(scope: NodeId) -> Self {
        Self {
            scope,
            index: HashMap::new(),
            indexed: false,
            placed: HashSet::new(),
            removals: Vec::new(),
            doomed: HashSet::new(),
            pending: Vec::new(),
            report: SyncReport::default(),
        }
    }

    /// Remember the original ids of children read from the target.
    fn learn(&mut self, children: &[(ChildKey, NodeId)]) {
        for (key, id) in children {
            if let ChildKey::Id(original) = key {
                self.index.entry(original.clone()).or_insert(*id);
            }
        }
    }

    /// The target node with original id `id`, indexing the target subtree
    /// the first time an id is not among the nodes read so far.
    async fn resolve(&mut self, tx: &WriteTransaction, id: &str) -> SyncResult<Option<NodeId>> {
        if !self.indexed && !self.index.contains_key(id) {
            let nodes = tx.load_subtree(self.scope).await?;
            debug!(nodes = nodes.len(), "indexed original ids of the target");
            for node in nodes {
                if let Some(original) = node.property(ORIGINAL_ID_PROPERTY) {
                    self.index.entry(original.to_owned()).or_insert(node.id);
                }
            }
            self.indexed = true;
        }
        Ok(self.index.get(id).copied())
    }

    fn schedule_removal(&mut self, id: NodeId) {
        if self.doomed.insert(id) {
            self.removals.push(id);
        }
    }

    fn rescue(&mut self, id: NodeId) {
        self.doomed.remove(&id);
    }
}

/// Progress of a running synchronization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncProgress {
    /// Source nodes visited so far, skipped subtrees counting once.
    pub visited: usize,
    /// Size of the source, if it knows it.
    pub expected: Option<usize>,
}

/// Called after every visited source node.
pub type SyncProgressCallback<'a> = &'a (dyn Fn(SyncProgress) + Send + Sync);

/// Synchronizes a target subtree with a [`SyncSource`].
pub struct ModelSynchronizer<'a> {
    source: &'a dyn SyncSource,
    ids: &'a dyn IdGenerator,
    filter: &'a dyn SyncFilter,
    schema: &'a dyn Schema,
    progress: Option<SyncProgressCallback<'a>>,
}

impl<'a> ModelSynchronizer<'a> {
    /// A synchronizer that visits every node and treats all roles as ordered.
    pub fn new(source: &'a dyn SyncSource, ids: &'a dyn IdGenerator) -> Self {
        Self {
            source,
            ids,
            filter: &AllNodes,
            schema: &OpenSchema,
            progress: None,
        }
    }

    /// Only visit what `filter` asks for, typically an
    /// [`InvalidationTree`](crate::InvalidationTree).
    pub fn with_filter(mut self, filter: &'a dyn SyncFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_schema(mut self, schema: &'a dyn Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_progress(mut self, progress: SyncProgressCallback<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Make the subtree of `target_root` match the source.
    ///
    /// The source root is matched with `target_root` regardless of ids.
    pub async fn synchronize(&self, tx: &mut WriteTransaction, target_root: NodeId) -> SyncResult<SyncReport> {
        let start = tx.operations().len();
        let expected = self.source.size_hint();
        let mut visited = 0;
        let mut walk = Walk::new(target_root);

        let root = self.source.root().await?;
        if let Some(id) = &root.original_id {
            walk.index.insert(id.clone(), target_root);
        }
        walk.placed.insert(target_root);

        let mut stack = vec![Visit {
            path: vec![root.handle],
            source: root,
            target: target_root,
            forced: false,
        }];
        while let Some(visit) = stack.pop() {
            let children = if visit.forced || self.filter.needs_synchronization(&visit.path) {
                self.sync_node(tx, &visit.source, visit.target, &mut walk).await?;
                self.sync_children(tx, &visit.source, visit.target, &mut walk).await?
            } else if self.filter.needs_descent(&visit.path) {
                self.match_children(tx, &visit.source, visit.target, &mut walk).await?
            } else {
                walk.report.skipped_subtrees += 1;
                Vec::new()
            };
            visited += 1;
            if let Some(progress) = self.progress {
                progress(SyncProgress { visited, expected });
            }

            for child in children.into_iter().rev() {
                let mut path = visit.path.clone();
                path.push(child.source.handle);
                stack.push(Visit {
                    source: child.source,
                    target: child.target,
                    path,
                    forced: child.created,
                });
            }
        }

        self.remove_unmatched(tx, &mut walk).await?;
        self.resolve_references(tx, &mut walk).await?;

        let mut report = walk.report;
        report.record(&tx.operations()[start..]);
        if report.unresolved_references + report.unresolved_concepts + report.unresolved_roles > 0 {
            warn!(
                references = report.unresolved_references,
                concepts = report.unresolved_concepts,
                roles = report.unresolved_roles,
                "synchronized with unresolved schema items"
            );
        }
        info!(
            added = report.added,
            deleted = report.deleted,
            moved = report.moved,
            properties = report.properties_changed,
            references = report.references_changed,
            skipped = report.skipped_subtrees,
            "synchronized model"
        );
        Ok(report)
    }

    async fn sync_node(
        &self,
        tx: &mut WriteTransaction,
        source: &SourceNode,
        target: NodeId,
        walk: &mut Walk,
    ) -> SyncResult<()> {
        let node = tx.node(target).await?;

        if let Some(id) = &source.original_id {
            if node.property(ORIGINAL_ID_PROPERTY) != Some(id.as_str()) {
                tx.set_property(target, ORIGINAL_ID_PROPERTY, Some(id.clone())).await?;
            }
        }

        if let Some(concept) = &source.concept {
            if !self.schema.resolves_concept(concept) {
                walk.report.unresolved_concepts += 1;
                debug!(%concept, node = %target, "unknown concept");
            }
        }
        tx.set_concept(target, source.concept.clone()).await?;

        for (role, value) in &source.properties {
            tx.set_property(target, role, Some(value.clone())).await?;
        }
        for role in node.properties.keys() {
            if role != ORIGINAL_ID_PROPERTY && !source.properties.contains_key(role) {
                tx.set_property(target, role, None).await?;
            }
        }

        for role in node.references.keys() {
            if !source.references.contains_key(role) {
                tx.set_reference(target, role, None).await?;
            }
        }
        walk.pending.extend(source.references.iter().map(|(role, target_id)| PendingReference {
            node: target,
            role: role.clone(),
            target: target_id.clone(),
        }));
        Ok(())
    }

    async fn sync_children(
        &self,
        tx: &mut WriteTransaction,
        source: &SourceNode,
        target: NodeId,
        walk: &mut Walk,
    ) -> SyncResult<Vec<Placed>> {
        let children = self.source.children(source).await?;
        let concept = tx.node(target).await?.concept;

        let mut roles: Vec<Option<String>> = Vec::new();
        let existing_roles = tx.roles_of_children(target).await?;
        for role in children.iter().map(|c| c.role.clone()).chain(existing_roles) {
            if !roles.contains(&role) {
                roles.push(role);
            }
        }

        let mut placed = Vec::with_capacity(children.len());
        for role in roles {
            let desired: Vec<&SourceNode> = children.iter().filter(|c| c.role == role).collect();
            placed.extend(
                self.sync_role(tx, target, concept.as_ref(), role.as_deref(), &desired, walk)
                    .await?,
            );
        }
        Ok(placed)
    }

    async fn sync_role(
        &self,
        tx: &mut WriteTransaction,
        parent: NodeId,
        concept: Option<&ConceptRef>,
        role: Option<&str>,
        desired: &[&SourceNode],
        walk: &mut Walk,
    ) -> SyncResult<Vec<Placed>> {
        let existing = role_children(tx, parent, role).await?;
        walk.learn(&existing);
        let existing_keys: Vec<ChildKey> = existing.iter().map(|(key, _)| key.clone()).collect();
        let desired_keys = source_keys(desired);
        let by_key: HashMap<ChildKey, NodeId> = existing.iter().cloned().collect();

        let ordering = self.schema.role_ordering(concept, role);
        if ordering == RoleOrdering::Unknown && role.is_some() {
            walk.report.unresolved_roles += 1;
            debug!(role = role.unwrap_or_default(), "undeclared role, treating as ordered");
        }

        let placed = if desired_keys == existing_keys {
            let mut placed = Vec::with_capacity(desired.len());
            for (source, (_, id)) in desired.iter().zip(&existing) {
                placed.push(self.keep(source, *id, walk));
            }
            placed
        } else if existing.is_empty() && all_unknown(tx, &desired_keys, &by_key, walk).await? {
            let mut placed = Vec::with_capacity(desired.len());
            for (source, key) in desired.iter().zip(&desired_keys) {
                placed.push(self.create(tx, parent, role, None, source, key, walk).await?);
            }
            placed
        } else if ordering == RoleOrdering::Unordered {
            self.sync_unordered(tx, parent, role, desired, &desired_keys, &by_key, walk)
                .await?
        } else {
            let kept = common_subsequence(&existing_keys, &desired_keys);
            self.sync_ordered(tx, parent, role, desired, &desired_keys, &by_key, &kept, walk)
                .await?
        };

        let keep: HashSet<NodeId> = placed.iter().map(|p| p.target).collect();
        for child in tx.children_in_role(parent, role).await? {
            if !keep.contains(&child) {
                walk.schedule_removal(child);
            }
        }
        Ok(placed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_ordered(
        &self,
        tx: &mut WriteTransaction,
        parent: NodeId,
        role: Option<&str>,
        desired: &[&SourceNode],
        keys: &[ChildKey],
        by_key: &HashMap<ChildKey, NodeId>,
        kept: &HashSet<ChildKey>,
        walk: &mut Walk,
    ) -> SyncResult<Vec<Placed>> {
        let mut placed = Vec::with_capacity(desired.len());
        let mut previous: Option<NodeId> = None;
        for (source, key) in desired.iter().zip(keys) {
            let next = match lookup(tx, key, by_key, walk).await? {
                Some(id) if kept.contains(key) && by_key.get(key) == Some(&id) => self.keep(source, id, walk),
                Some(id) => {
                    let index = index_after(tx, parent, role, previous, Some(id)).await?;
                    tx.move_child(parent, role, Some(index), id).await?;
                    walk.rescue(id);
                    self.keep(source, id, walk)
                }
                None => {
                    let index = index_after(tx, parent, role, previous, None).await?;
                    self.create(tx, parent, role, Some(index), source, key, walk).await?
                }
            };
            previous = Some(next.target);
            placed.push(next);
        }
        Ok(placed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_unordered(
        &self,
        tx: &mut WriteTransaction,
        parent: NodeId,
        role: Option<&str>,
        desired: &[&SourceNode],
        keys: &[ChildKey],
        by_key: &HashMap<ChildKey, NodeId>,
        walk: &mut Walk,
    ) -> SyncResult<Vec<Placed>> {
        let mut placed = Vec::with_capacity(desired.len());
        for (source, key) in desired.iter().zip(keys) {
            let next = match lookup(tx, key, by_key, walk).await? {
                Some(id) if by_key.get(key) == Some(&id) => self.keep(source, id, walk),
                Some(id) => {
                    tx.move_child(parent, role, None, id).await?;
                    walk.rescue(id);
                    self.keep(source, id, walk)
                }
                None => self.create(tx, parent, role, None, source, key, walk).await?,
            };
            placed.push(next);
        }
        Ok(placed)
    }

    /// Pair source children with existing targets without changing anything.
    async fn match_children(
        &self,
        tx: &mut WriteTransaction,
        source: &SourceNode,
        target: NodeId,
        walk: &mut Walk,
    ) -> SyncResult<Vec<Placed>> {
        let children = self.source.children(source).await?;
        let mut roles: Vec<Option<String>> = Vec::new();
        for child in &children {
            if !roles.contains(&child.role) {
                roles.push(child.role.clone());
            }
        }

        let mut matched = Vec::with_capacity(children.len());
        for role in roles {
            let desired: Vec<&SourceNode> = children.iter().filter(|c| c.role == role).collect();
            let existing = role_children(tx, target, role.as_deref()).await?;
            walk.learn(&existing);
            let by_key: HashMap<ChildKey, NodeId> = existing.into_iter().collect();
            for (source, key) in desired.iter().zip(source_keys(&desired)) {
                match lookup(tx, &key, &by_key, walk).await? {
                    Some(id) => matched.push(self.keep(source, id, walk)),
                    None => {
                        walk.report.unmatched += 1;
                        warn!(?key, parent = %target, "no target node for unchanged source node");
                    }
                }
            }
        }
        Ok(matched)
    }

    fn keep(&self, source: &SourceNode, id: NodeId, walk: &mut Walk) -> Placed {
        walk.placed.insert(id);
        Placed {
            source: source.clone(),
            target: id,
            created: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        tx: &mut WriteTransaction,
        parent: NodeId,
        role: Option<&str>,
        index: Option<usize>,
        source: &SourceNode,
        key: &ChildKey,
        walk: &mut Walk,
    ) -> SyncResult<Placed> {
        let id = self.ids.generate();
        tx.add_new_child(parent, role, index, id, source.concept.clone()).await?;
        if let ChildKey::Id(original) = key {
            walk.index.insert(original.clone(), id);
        }
        walk.placed.insert(id);
        Ok(Placed {
            source: source.clone(),
            target: id,
            created: true,
        })
    }

    async fn remove_unmatched(&self, tx: &mut WriteTransaction, walk: &mut Walk) -> SyncResult<()> {
        for id in std::mem::take(&mut walk.removals) {
            if walk.doomed.contains(&id) && tx.contains(id).await? {
                tx.delete_node(id).await?;
            }
        }
        Ok(())
    }

    async fn resolve_references(&self, tx: &mut WriteTransaction, walk: &mut Walk) -> SyncResult<()> {
        for pending in std::mem::take(&mut walk.pending) {
            let target = match resolve_reference(tx, &pending, walk).await? {
                Some(id) => NodeReference::Local(id),
                None => {
                    walk.report.unresolved_references += 1;
                    debug!(node = %pending.node, role = %pending.role, target = %pending.target, "unresolved reference");
                    NodeReference::Serialized(pending.target)
                }
            };
            tx.set_reference(pending.node, &pending.role, Some(target)).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ModelSynchronizer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSynchronizer").finish_non_exhaustive()
    }
}

/// The node a pending reference points at, if it exists.
///
/// A reference that already points at a node with the wanted original id
/// is kept without consulting the index.
async fn resolve_reference(
    tx: &WriteTransaction,
    pending: &PendingReference,
    walk: &mut Walk,
) -> SyncResult<Option<NodeId>> {
    if !walk.index.contains_key(&pending.target) {
        let current = tx.node(pending.node).await?.references.remove(&pending.role);
        if let Some(NodeReference::Local(id)) = current {
            if let Some(node) = tx.get(id).await? {
                if node.property(ORIGINAL_ID_PROPERTY) == Some(pending.target.as_str()) {
                    return Ok(Some(id));
                }
            }
        }
    }
    match walk.resolve(tx, &pending.target).await? {
        Some(id) if tx.contains(id).await? => Ok(Some(id)),
        _ => Ok(None),
    }
}

async fn role_children(
    tx: &WriteTransaction,
    parent: NodeId,
    role: Option<&str>,
) -> SyncResult<Vec<(ChildKey, NodeId)>> {
    let ids = tx.children_in_role(parent, role).await?;
    let mut position = 0;
    Ok(tx
        .nodes(&ids)
        .await?
        .into_iter()
        .map(|node| match node.property(ORIGINAL_ID_PROPERTY) {
            Some(id) => (ChildKey::Id(id.to_owned()), node.id),
            None => {
                position += 1;
                (ChildKey::Position(position - 1), node.id)
            }
        })
        .collect())
}

fn source_keys(children: &[&SourceNode]) -> Vec<ChildKey> {
    let mut position = 0;
    children
        .iter()
        .map(|child| match &child.original_id {
            Some(id) => ChildKey::Id(id.clone()),
            None => {
                position += 1;
                ChildKey::Position(position - 1)
            }
        })
        .collect()
}

/// The unplaced target node for `key`: a child of the current role, or any
/// node with that original id.
async fn lookup(
    tx: &WriteTransaction,
    key: &ChildKey,
    by_key: &HashMap<ChildKey, NodeId>,
    walk: &mut Walk,
) -> SyncResult<Option<NodeId>> {
    let found = match (by_key.get(key), key) {
        (Some(id), _) => Some(*id),
        (None, ChildKey::Id(id)) => walk.resolve(tx, id).await?,
        (None, ChildKey::Position(_)) => None,
    };
    Ok(found.filter(|id| !walk.placed.contains(id)))
}

/// Whether none of `keys` has an unplaced target node.
async fn all_unknown(
    tx: &WriteTransaction,
    keys: &[ChildKey],
    by_key: &HashMap<ChildKey, NodeId>,
    walk: &mut Walk,
) -> SyncResult<bool> {
    for key in keys {
        if lookup(tx, key, by_key, walk).await?.is_some() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Keys of a longest common subsequence of both orders.
fn common_subsequence(existing: &[ChildKey], desired: &[ChildKey]) -> HashSet<ChildKey> {
    let wanted: HashSet<&ChildKey> = desired.iter().collect();
    let present: HashSet<&ChildKey> = existing.iter().collect();
    let old: Vec<&ChildKey> = existing.iter().filter(|k| wanted.contains(k)).collect();
    let new: Vec<&ChildKey> = desired.iter().filter(|k| present.contains(k)).collect();

    capture_diff_slices(Algorithm::Myers, &old, &new)
        .into_iter()
        .filter_map(|op| match op {
            DiffOp::Equal { old_index, len, .. } => Some(old_index..old_index + len),
            _ => None,
        })
        .flatten()
        .map(|i| old[i].clone())
        .collect()
}

/// Role-local index right after `previous`, or the first slot.
async fn index_after(
    tx: &WriteTransaction,
    parent: NodeId,
    role: Option<&str>,
    previous: Option<NodeId>,
    moving: Option<NodeId>,
) -> SyncResult<usize> {
    let mut siblings = tx.children_in_role(parent, role).await?;
    if let Some(id) = moving {
        siblings.retain(|c| *c != id);
    }
    Ok(match previous {
        None => 0,
        Some(p) => siblings
            .iter()
            .position(|c| *c == p)
            .map_or(siblings.len(), |i| i + 1),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arbor_store::{BulkQuery, BulkQueryConfig, InMemoryObjectStore};
    use arbor_tree::Tree;
    use arbor_types::{ClientIdGenerator, RepositoryId};

    use super::*;
    use crate::invalidation::{invalidate_changes, InvalidationTree};
    use crate::schema::DeclaredSchema;
    use crate::source::{SpecSource, TreeSource};
    use crate::spec::NodeSpec;

    struct Fixture {
        store: Arc<BulkQuery>,
        ids: ClientIdGenerator,
        tree: Tree,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(BulkQuery::new(
                Arc::new(InMemoryObjectStore::new()),
                &BulkQueryConfig::default(),
            ));
            let tree = Tree::create_empty(RepositoryId::new("target").unwrap(), &store)
                .await
                .unwrap();
            Self {
                store,
                ids: ClientIdGenerator::new(7),
                tree,
            }
        }

        async fn import(&mut self, json: &str) -> SyncReport {
            self.import_with(json, &OpenSchema).await
        }

        async fn import_with(&mut self, json: &str, schema: &dyn Schema) -> SyncReport {
            let spec = NodeSpec::from_json(json).unwrap();
            let source = SpecSource::new(&spec);
            let mut tx = WriteTransaction::new(&self.tree, self.store.clone());
            let report = ModelSynchronizer::new(&source, &self.ids)
                .with_schema(schema)
                .synchronize(&mut tx, NodeId::ROOT)
                .await
                .unwrap();
            self.tree = tx.commit().await.unwrap().0;
            report
        }

        async fn find(&self, original: &str) -> NodeId {
            self.tree
                .load_subtree(NodeId::ROOT)
                .await
                .unwrap()
                .into_iter()
                .find(|n| n.property(ORIGINAL_ID_PROPERTY) == Some(original))
                .map(|n| n.id)
                .unwrap_or_else(|| panic!("no node {original}"))
        }

        /// Original ids of the children of `parent` in `role`.
        async fn children(&self, parent: NodeId, role: &str) -> Vec<String> {
            let ids = self.tree.children_in_role(parent, Some(role)).await.unwrap();
            self.tree
                .nodes(&ids)
                .await
                .unwrap()
                .into_iter()
                .map(|n| n.property(ORIGINAL_ID_PROPERTY).unwrap_or_default().to_owned())
                .collect()
        }
    }

    // ------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------

    const MODEL: &str = r#"{
        "id": "root",
        "children": [
            {"id": "a", "role": "items", "properties": {"name": "A"}, "references": {"ref": "b"}},
            {"id": "b", "role": "items", "properties": {"name": "B"},
             "children": [{"id": "j", "role": "children"}]},
            {"id": "c", "role": "items", "properties": {"name": "C"}, "references": {"ref": "d"}},
            {"id": "d", "role": "items", "properties": {"name": "D"}},
            {"id": "e", "role": "items", "properties": {"name": "E"}, "references": {"ref": "f"}},
            {"id": "f", "role": "items", "properties": {"name": "F"}},
            {"id": "g", "role": "items", "properties": {"name": "G"}},
            {"id": "h", "role": "other"},
            {"id": "i", "role": "other"}
        ]
    }"#;

    const EDITED: &str = r#"{
        "id": "root",
        "children": [
            {"id": "b", "role": "items", "properties": {"name": "B2"}},
            {"id": "a", "role": "items", "properties": {"name": "A2"}, "references": {"ref": "c"},
             "children": [{"id": "h", "role": "children"}]},
            {"id": "d", "role": "items"},
            {"id": "c", "role": "items", "properties": {"name": "C", "extra": "1"},
             "children": [{"id": "j", "role": "children"}]},
            {"id": "f", "role": "items", "properties": {"name": "F"}, "references": {"ref": "a"}},
            {"id": "e", "role": "items", "properties": {"name": "E"}, "references": {"ref": "f"}},
            {"id": "g", "role": "other", "properties": {"name": "G"}},
            {"id": "x", "role": "other"}
        ]
    }"#;

    #[tokio::test]
    async fn initial_import_builds_the_model() {
        let mut f = Fixture::new().await;
        let report = f.import(MODEL).await;
        assert_eq!(report.added, 10);
        assert_eq!(report.ids_assigned, 11);
        assert_eq!(report.properties_changed, 7);
        assert_eq!(report.references_changed, 3);
        assert_eq!(report.deleted + report.moved, 0);
        assert_eq!(report.unresolved_references, 0);

        let root = NodeId::ROOT;
        assert_eq!(f.children(root, "items").await, ["a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(f.children(root, "other").await, ["h", "i"]);
        let a = f.find("a").await;
        let b = f.find("b").await;
        assert_eq!(f.tree.reference(a, "ref").await.unwrap(), Some(NodeReference::Local(b)));
        assert_eq!(f.tree.property(root, ORIGINAL_ID_PROPERTY).await.unwrap().as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn reimport_of_unchanged_model_is_a_noop() {
        let mut f = Fixture::new().await;
        f.import(MODEL).await;
        let before = f.tree.hash();
        let report = f.import(MODEL).await;
        assert!(report.is_unchanged(), "{report:?}");
        assert_eq!(f.tree.hash(), before);
    }

    #[tokio::test]
    async fn edited_model_needs_minimal_changes() {
        let mut f = Fixture::new().await;
        f.import(MODEL).await;
        let report = f.import(EDITED).await;

        assert_eq!(report.added, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.moved, 6);
        assert_eq!(report.properties_changed, 4);
        assert_eq!(report.references_changed, 3);
        assert_eq!(report.concepts_changed, 0);

        let root = NodeId::ROOT;
        assert_eq!(f.children(root, "items").await, ["b", "a", "d", "c", "f", "e"]);
        assert_eq!(f.children(root, "other").await, ["g", "x"]);
        assert_eq!(f.children(f.find("a").await, "children").await, ["h"]);
        assert_eq!(f.children(f.find("c").await, "children").await, ["j"]);
        assert!(f.children(f.find("b").await, "children").await.is_empty());

        let a = f.find("a").await;
        let c = f.find("c").await;
        let d = f.find("d").await;
        assert_eq!(f.tree.reference(a, "ref").await.unwrap(), Some(NodeReference::Local(c)));
        assert_eq!(f.tree.reference(c, "ref").await.unwrap(), None);
        assert_eq!(f.tree.property(d, "name").await.unwrap(), None);

        assert!(f.import(EDITED).await.is_unchanged());
    }

    #[tokio::test]
    async fn unordered_roles_only_change_membership() {
        let schema = DeclaredSchema::new().concept("Container", [], ["items"]);
        let mut f = Fixture::new().await;
        f.import_with(
            r#"{"id": "root", "concept": "Container", "children": [
                {"id": "A", "role": "items"}, {"id": "B", "role": "items"}, {"id": "C", "role": "items"}]}"#,
            &schema,
        )
        .await;

        let report = f
            .import_with(
                r#"{"id": "root", "concept": "Container", "children": [
                    {"id": "B", "role": "items"}, {"id": "D", "role": "items"}, {"id": "A", "role": "items"}]}"#,
                &schema,
            )
            .await;
        assert_eq!(f.children(NodeId::ROOT, "items").await, ["A", "B", "D"]);
        assert_eq!(report.moved, 0);
        assert_eq!(report.added, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.unresolved_roles, 0);
    }

    #[tokio::test]
    async fn undeclared_items_are_counted_not_fatal() {
        let schema = DeclaredSchema::new().concept("Container", [], ["items"]);
        let mut f = Fixture::new().await;
        let report = f
            .import_with(
                r#"{"id": "root", "concept": "Container", "children": [
                    {"id": "A", "role": "parts", "concept": "Widget", "references": {"peer": "missing"}}]}"#,
                &schema,
            )
            .await;
        assert_eq!(report.added, 1);
        assert_eq!(report.unresolved_roles, 1);
        assert_eq!(report.unresolved_concepts, 1);
        assert_eq!(report.unresolved_references, 1);

        let a = f.find("A").await;
        assert_eq!(
            f.tree.reference(a, "peer").await.unwrap(),
            Some(NodeReference::Serialized("missing".into()))
        );
    }

    #[tokio::test]
    async fn forward_references_resolve_after_the_walk() {
        let mut f = Fixture::new().await;
        let report = f
            .import(
                r#"{"children": [
                    {"id": "first", "references": {"next": "second"}},
                    {"id": "outer", "children": [{"id": "second", "references": {"prev": "first"}}]}]}"#,
            )
            .await;
        assert_eq!(report.unresolved_references, 0);
        let first = f.find("first").await;
        let second = f.find("second").await;
        assert_eq!(f.tree.reference(first, "next").await.unwrap(), Some(NodeReference::Local(second)));
        assert_eq!(f.tree.reference(second, "prev").await.unwrap(), Some(NodeReference::Local(first)));
    }

    #[tokio::test]
    async fn nodes_moved_out_of_deleted_subtrees_survive() {
        let mut f = Fixture::new().await;
        f.import(r#"{"children": [{"id": "p", "children": [{"id": "keep"}, {"id": "drop"}]}]}"#)
            .await;
        let keep = f.find("keep").await;

        let report = f.import(r#"{"children": [{"id": "keep"}]}"#).await;
        assert_eq!(report.moved, 1);
        assert_eq!(report.deleted, 2);
        assert_eq!(f.find("keep").await, keep);
        assert_eq!(f.tree.parent(keep).await.unwrap(), Some(NodeId::ROOT));
    }

    #[tokio::test]
    async fn id_less_nodes_match_by_position() {
        let mut f = Fixture::new().await;
        f.import(r#"{"children": [{"properties": {"v": "1"}}, {"properties": {"v": "2"}}]}"#)
            .await;
        let first = f.tree.children(NodeId::ROOT).await.unwrap();

        let report = f
            .import(r#"{"children": [{"properties": {"v": "1"}}, {"properties": {"v": "3"}}, {"properties": {"v": "4"}}]}"#)
            .await;
        assert_eq!(report.added, 1);
        assert_eq!(report.properties_changed, 2);
        assert_eq!(report.moved + report.deleted, 0);
        assert_eq!(f.tree.children(NodeId::ROOT).await.unwrap()[..2], first[..]);
    }

    #[tokio::test]
    async fn failed_sync_leaves_transaction_uncommitted() {
        let f = Fixture::new().await;
        let spec = NodeSpec::from_json(r#"{"children": [{"id": "a"}]}"#).unwrap();
        let source = SpecSource::new(&spec);
        let mut tx = WriteTransaction::new(&f.tree, f.store.clone());
        let missing = NodeId::new(404);
        assert!(ModelSynchronizer::new(&source, &f.ids)
            .synchronize(&mut tx, missing)
            .await
            .is_err());
        drop(tx);
        assert_eq!(f.tree.children(NodeId::ROOT).await.unwrap(), Vec::<NodeId>::new());
    }

    #[tokio::test]
    async fn progress_is_reported_per_visited_node() {
        let f = Fixture::new().await;
        let spec = NodeSpec::from_json(MODEL).unwrap();
        let source = SpecSource::new(&spec);
        let steps = std::sync::Mutex::new(Vec::new());
        let record = |p: SyncProgress| steps.lock().unwrap().push(p);

        let mut tx = WriteTransaction::new(&f.tree, f.store.clone());
        ModelSynchronizer::new(&source, &f.ids)
            .with_progress(&record)
            .synchronize(&mut tx, NodeId::ROOT)
            .await
            .unwrap();

        let steps = steps.into_inner().unwrap();
        assert_eq!(steps.len(), 11);
        assert_eq!(steps[0], SyncProgress { visited: 1, expected: Some(11) });
        assert_eq!(steps[10].visited, 11);
    }

    // ------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------

    #[test]
    fn common_subsequence_keeps_a_longest_shared_order() {
        let id = |s: &str| ChildKey::Id(s.to_owned());
        let existing = [id("a"), id("b"), id("c"), id("d"), ChildKey::Position(0)];
        let desired = [id("b"), id("a"), id("c"), id("x"), id("d")];

        let kept = common_subsequence(&existing, &desired);
        assert_eq!(kept.len(), 3);
        assert!(kept.contains(&id("c")) && kept.contains(&id("d")));
        assert!(!kept.contains(&id("x")));
        assert!(!kept.contains(&ChildKey::Position(0)));

        let same = common_subsequence(&existing, &existing);
        assert_eq!(same.len(), existing.len());
    }

    #[tokio::test]
    async fn reversed_order_moves_all_but_one() {
        let mut f = Fixture::new().await;
        f.import(r#"{"children": [{"id": "a"}, {"id": "b"}, {"id": "c"}, {"id": "d"}]}"#)
            .await;
        let report = f
            .import(r#"{"children": [{"id": "d"}, {"id": "c"}, {"id": "b"}, {"id": "a"}]}"#)
            .await;
        assert_eq!(report.moved, 3);
        assert_eq!(report.added + report.deleted, 0);
        let order: Vec<String> = f
            .tree
            .nodes(&f.tree.children(NodeId::ROOT).await.unwrap())
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.property(ORIGINAL_ID_PROPERTY).unwrap_or_default().to_owned())
            .collect();
        assert_eq!(order, ["d", "c", "b", "a"]);
    }

    // ------------------------------------------------------------------
    // Tree to tree
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn tree_sync_visits_only_invalidated_nodes() {
        let store = Arc::new(BulkQuery::new(
            Arc::new(InMemoryObjectStore::new()),
            &BulkQueryConfig::default(),
        ));
        let n = NodeId::new;
        let empty = Tree::create_empty(RepositoryId::new("source").unwrap(), &store)
            .await
            .unwrap();
        let mut tx = WriteTransaction::new(&empty, store.clone());
        for (parent, id) in [(1, 2), (1, 3), (1, 4), (3, 31), (3, 32), (31, 311)] {
            tx.add_new_child(n(parent), Some("items"), None, n(id), None).await.unwrap();
            tx.set_property(n(id), "name", Some(format!("n{id}"))).await.unwrap();
        }
        tx.set_reference(n(4), "ref", Some(NodeReference::Local(n(311)))).await.unwrap();
        let (source_v1, _) = tx.commit().await.unwrap();

        let target_empty = Tree::create_empty(RepositoryId::new("mirror").unwrap(), &store)
            .await
            .unwrap();
        let ids = ClientIdGenerator::new(9);
        let mut tx = WriteTransaction::new(&target_empty, store.clone());
        let source = TreeSource::new(source_v1.clone());
        let report = ModelSynchronizer::new(&source, &ids)
            .synchronize(&mut tx, NodeId::ROOT)
            .await
            .unwrap();
        assert_eq!(report.added, 6);
        let (mirror_v1, _) = tx.commit().await.unwrap();
        assert_eq!(
            NodeSpec::export(&mirror_v1, NodeId::ROOT).await.unwrap(),
            NodeSpec::export(&source_v1, NodeId::ROOT).await.unwrap()
        );

        let mut tx = WriteTransaction::new(&source_v1, store.clone());
        tx.set_property(n(311), "name", Some("changed".into())).await.unwrap();
        tx.add_new_child(n(2), Some("items"), None, n(21), None).await.unwrap();
        let (source_v2, _) = tx.commit().await.unwrap();

        let mut invalidation = InvalidationTree::default();
        invalidate_changes(&mut invalidation, &source_v1, &source_v2)
            .await
            .unwrap();

        let mut tx = WriteTransaction::new(&mirror_v1, store.clone());
        let source = TreeSource::new(source_v2.clone());
        let report = ModelSynchronizer::new(&source, &ids)
            .with_filter(&invalidation)
            .synchronize(&mut tx, NodeId::ROOT)
            .await
            .unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.properties_changed, 1);
        assert_eq!(report.deleted + report.moved, 0);
        assert!(report.skipped_subtrees >= 2);
        assert_eq!(report.unmatched, 0);

        let (mirror_v2, _) = tx.commit().await.unwrap();
        assert_eq!(
            NodeSpec::export(&mirror_v2, NodeId::ROOT).await.unwrap(),
            NodeSpec::export(&source_v2, NodeId::ROOT).await.unwrap()
        );
    }

    #[tokio::test]
    async fn filtered_sync_reads_only_visited_paths() {
        let backend = Arc::new(InMemoryObjectStore::new());
        let store = Arc::new(BulkQuery::new(backend.clone(), &BulkQueryConfig::default()));
        let n = NodeId::new;

        // 20 groups of 50 items, each referring to its predecessor.
        let empty = Tree::create_empty(RepositoryId::new("source").unwrap(), &store)
            .await
            .unwrap();
        let mut tx = WriteTransaction::new(&empty, store.clone());
        for g in 0..20u64 {
            let group = n(1000 + g);
            tx.add_new_child(NodeId::ROOT, Some("groups"), None, group, None).await.unwrap();
            for i in 0..50u64 {
                let item = n(100_000 + g * 100 + i);
                tx.add_new_child(group, Some("items"), None, item, None).await.unwrap();
                tx.set_property(item, "name", Some(format!("item {g}.{i}"))).await.unwrap();
                if i > 0 {
                    tx.set_reference(item, "previous", Some(NodeReference::Local(n(item.as_u64() - 1))))
                        .await
                        .unwrap();
                }
            }
        }
        let (source_v1, _) = tx.commit().await.unwrap();

        let target = Tree::create_empty(RepositoryId::new("mirror").unwrap(), &store)
            .await
            .unwrap();
        let ids = ClientIdGenerator::new(9);
        let mut tx = WriteTransaction::new(&target, store.clone());
        let report = ModelSynchronizer::new(&TreeSource::new(source_v1.clone()), &ids)
            .synchronize(&mut tx, NodeId::ROOT)
            .await
            .unwrap();
        assert_eq!(report.added, 1020);
        let (mirror_v1, _) = tx.commit().await.unwrap();

        let changed = n(100_000 + 7 * 100 + 25);
        let mut tx = WriteTransaction::new(&source_v1, store.clone());
        tx.set_property(changed, "name", Some("renamed".into())).await.unwrap();
        let (source_v2, _) = tx.commit().await.unwrap();
        let mut invalidation = InvalidationTree::default();
        invalidate_changes(&mut invalidation, &source_v1, &source_v2)
            .await
            .unwrap();

        // Reading the whole mirror from a cold cache, for comparison.
        let cold = Arc::new(BulkQuery::new(backend.clone(), &BulkQueryConfig::default()));
        Tree::load(cold.clone(), &mirror_v1.hash())
            .await
            .unwrap()
            .load_subtree(NodeId::ROOT)
            .await
            .unwrap();
        let full = cold.stats().fetched;

        let cold = Arc::new(BulkQuery::new(backend, &BulkQueryConfig::default()));
        let mirror = Tree::load(cold.clone(), &mirror_v1.hash()).await.unwrap();
        let mut tx = WriteTransaction::new(&mirror, cold.clone());
        let report = ModelSynchronizer::new(&TreeSource::new(source_v2.clone()), &ids)
            .with_filter(&invalidation)
            .synchronize(&mut tx, NodeId::ROOT)
            .await
            .unwrap();
        assert_eq!(report.changes(), 1, "{report:?}");
        assert_eq!(report.properties_changed, 1);
        assert_eq!(report.unresolved_references, 0);
        assert!(report.skipped_subtrees >= 19 + 49);

        let fetched = cold.stats().fetched;
        assert!(fetched * 4 < full, "filtered sync fetched {fetched} of {full} objects");

        let (mirror_v2, _) = tx.commit().await.unwrap();
        assert_eq!(
            NodeSpec::export(&mirror_v2, NodeId::ROOT).await.unwrap(),
            NodeSpec::export(&source_v2, NodeId::ROOT).await.unwrap()
        );
    }
}
