//! Operation-log compression.
//!
//! Importing a large subtree records one `AddChild` per node plus its
//! properties and references. Such a log is replaced by a single
//! [`Operation::BulkSubtreeAdd`] pointing at the resulting tree, from which
//! the fine-grained operations can always be reconstructed.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;

use arbor_store::ObjectLoader;
use arbor_tree::{subtree_operations, Operation, Tree};

use crate::error::VersionResult;

/// Collapse a bulk subtree import into one `BulkSubtreeAdd`.
///
/// Only logs longer than `limit` are considered. The log must start with
/// the `AddChild` of the subtree root and continue with nothing but
/// `AddChild`, `SetProperty`, `SetReference` and `SetConcept` on nodes the
/// log itself created; anything else is returned unchanged.
pub fn compress_operations(ops: Vec<Operation>, tree: &Tree, limit: usize) -> Vec<Operation> {
    if ops.len() <= limit {
        return ops;
    }
    let Some(Operation::AddChild {
        parent,
        role,
        index,
        id: root,
        concept,
    }) = ops.first()
    else {
        return ops;
    };

    let mut created = HashSet::from([*root]);
    for op in &ops[1..] {
        let ok = match op {
            Operation::AddChild { parent, id, .. } => created.contains(parent) && created.insert(*id),
            Operation::SetProperty { id, .. }
            | Operation::SetReference { id, .. }
            | Operation::SetConcept { id, .. } => created.contains(id),
            _ => false,
        };
        if !ok {
            return ops;
        }
    }

    vec![Operation::BulkSubtreeAdd {
        source_tree: tree.hash(),
        parent: *parent,
        role: role.clone(),
        index: *index,
        root: *root,
        concept: concept.clone(),
    }]
}

/// The fine-grained operations a `BulkSubtreeAdd` stands for.
///
/// Any other operation is returned as is.
pub async fn expand_bulk_add(
    op: &Operation,
    loader: Arc<dyn ObjectLoader>,
) -> VersionResult<Vec<Operation>> {
    let Operation::BulkSubtreeAdd {
        source_tree,
        parent,
        role,
        index,
        root,
        ..
    } = op
    else {
        return Ok(vec![op.clone()]);
    };
    let source = Tree::load(loader, source_tree).await?;
    Ok(subtree_operations(&source, *root, *parent, role.clone(), *index).await?)
}

/// Expand every `BulkSubtreeAdd` of a log.
pub async fn expand_operations(
    ops: &[Operation],
    loader: Arc<dyn ObjectLoader>,
) -> VersionResult<Vec<Operation>> {
    let expanded = try_join_all(ops.iter().map(|op| expand_bulk_add(op, loader.clone()))).await?;
    Ok(expanded.into_iter().flatten().collect())
}
