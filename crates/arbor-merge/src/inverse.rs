//! Inverting the operations of a version.

use std::sync::Arc;

use arbor_store::{BulkQuery, ObjectLoader};
use arbor_tree::{Operation, Tree, TreeError, WriteTransaction};
use arbor_version::{expand_operations, Version};

use crate::error::MergeResult;

/// The tree a version's operations were applied to.
///
/// Merge versions are replayed on top of their common base, so this holds
/// for them as well. Versions without a base start from the empty tree.
pub async fn base_tree(version: &Version, store: &Arc<BulkQuery>) -> MergeResult<Tree> {
    match version.base_version().await? {
        Some(base) => Ok(base.tree().await?),
        None => {
            let tree = version.tree().await?;
            Ok(Tree::create_empty(tree.repository().clone(), store).await?)
        }
    }
}

/// The operations of `version` with bulk adds expanded.
pub async fn replayable_operations(version: &Version, store: &Arc<BulkQuery>) -> MergeResult<Vec<Operation>> {
    let loader: Arc<dyn ObjectLoader> = store.clone();
    Ok(expand_operations(&version.operations().await?, loader).await?)
}

/// Operations that cancel the changes of `version`, in application order.
///
/// The operations of the version are replayed on its base tree; before each
/// one, the state it overwrites is read back. The inverses are returned
/// last operation first.
pub async fn inverse_operations(version: &Version, store: &Arc<BulkQuery>) -> MergeResult<Vec<Operation>> {
    let ops = replayable_operations(version, store).await?;
    if ops.is_empty() {
        return Ok(Vec::new());
    }
    let mut tx = WriteTransaction::new(&base_tree(version, store).await?, store.clone());
    let mut inverses = Vec::with_capacity(ops.len());
    for op in &ops {
        inverses.push(invert(&tx, op).await?);
        tx.apply(op).await?;
    }
    Ok(inverses.into_iter().rev().flatten().collect())
}

async fn invert(tx: &WriteTransaction, op: &Operation) -> MergeResult<Vec<Operation>> {
    let inverse = match op {
        Operation::AddChild { id, .. } => vec![Operation::DeleteNode { id: *id }],
        Operation::DeleteNode { id } => {
            let node = tx.node(*id).await?;
            let parent = node.parent.ok_or(TreeError::RootNotRemovable)?;
            let index = tx
                .children_in_role(parent, node.role.as_deref())
                .await?
                .iter()
                .position(|c| c == id)
                .unwrap_or_default();
            let mut restore = vec![Operation::AddChild {
                parent,
                role: node.role.clone(),
                index,
                id: *id,
                concept: node.concept.clone(),
            }];
            restore.extend(node.properties.into_iter().map(|(role, value)| Operation::SetProperty {
                id: *id,
                role,
                value: Some(value),
            }));
            restore.extend(node.references.into_iter().map(|(role, target)| Operation::SetReference {
                id: *id,
                role,
                target: Some(target),
            }));
            restore
        }
        Operation::MoveChild { id, .. } => {
            let node = tx.node(*id).await?;
            let parent = node.parent.ok_or(TreeError::RootNotRemovable)?;
            let index = tx
                .children_in_role(parent, node.role.as_deref())
                .await?
                .iter()
                .position(|c| c == id)
                .unwrap_or_default();
            vec![Operation::MoveChild {
                parent,
                role: node.role,
                index,
                id: *id,
            }]
        }
        Operation::SetProperty { id, role, .. } => vec![Operation::SetProperty {
            id: *id,
            role: role.clone(),
            value: tx.node(*id).await?.properties.get(role).cloned(),
        }],
        Operation::SetReference { id, role, .. } => vec![Operation::SetReference {
            id: *id,
            role: role.clone(),
            target: tx.node(*id).await?.references.get(role).cloned(),
        }],
        Operation::SetConcept { id, .. } => vec![Operation::SetConcept {
            id: *id,
            concept: tx.node(*id).await?.concept,
        }],
        Operation::BulkSubtreeAdd { .. }
        | Operation::Revert { .. }
        | Operation::Undo { .. }
        | Operation::NoOp => Vec::new(),
    };
    Ok(inverse)
}
