//! Capturing what an operation meant and re-applying it elsewhere.
//!
//! A recorded index only makes sense against the tree the operation was
//! first applied to. Before replaying an operation on a merge result, its
//! neighbouring siblings are captured against that original tree; on the
//! merge result the node is placed next to whichever neighbour still exists.

use arbor_tree::{Operation, TreeResult, WriteTransaction, DETACHED_ROLE};
use arbor_types::NodeId;

/// The siblings around an added or moved node, within its role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Neighbours {
    pub before: Option<NodeId>,
    pub after: Option<NodeId>,
}

/// An operation together with the context needed to replay it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Intent {
    op: Operation,
    neighbours: Option<Neighbours>,
}

impl Intent {
    /// An intent without captured neighbours; restoring it falls back to
    /// the recorded index.
    pub fn positional(op: Operation) -> Self {
        Self {
            op,
            neighbours: None,
        }
    }

    /// Capture the intent of `op` against the state of `tx` right before
    /// `op` is applied to it.
    pub async fn capture(tx: &WriteTransaction, op: &Operation) -> TreeResult<Self> {
        let neighbours = match op {
            Operation::AddChild { parent, role, index, id, .. }
            | Operation::MoveChild { parent, role, index, id } => {
                let mut siblings = tx.children_in_role(*parent, role.as_deref()).await?;
                siblings.retain(|c| c != id);
                let index = (*index).min(siblings.len());
                Some(Neighbours {
                    before: index.checked_sub(1).map(|i| siblings[i]),
                    after: siblings.get(index).copied(),
                })
            }
            _ => None,
        };
        Ok(Self {
            op: op.clone(),
            neighbours,
        })
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    pub fn neighbours(&self) -> Option<Neighbours> {
        self.neighbours
    }

    /// Apply the intent to the current state of `tx`.
    ///
    /// Returns the operations actually applied. An intent that no longer
    /// applies (its node is gone, or a move would create a cycle) yields a
    /// single `NoOp`.
    pub async fn restore(&self, tx: &mut WriteTransaction) -> TreeResult<Vec<Operation>> {
        let start = tx.operations().len();
        match &self.op {
            Operation::AddChild { parent, role, index, id, concept } => {
                if !tx.contains(*id).await? {
                    let (parent, role, index) = self.placement(tx, *parent, role.as_deref(), *index, *id).await?;
                    tx.add_new_child(parent, role.as_deref(), index, *id, concept.clone())
                        .await?;
                }
            }
            Operation::MoveChild { parent, role, index, id } => {
                if !id.is_root() && tx.contains(*id).await? {
                    let (parent, role, index) = self.placement(tx, *parent, role.as_deref(), *index, *id).await?;
                    let cycle = parent == *id || tx.ancestors(parent).await?.contains(id);
                    if !cycle {
                        tx.move_child(parent, role.as_deref(), index, *id).await?;
                    }
                }
            }
            Operation::DeleteNode { id } => {
                if let Some(node) = tx.get(*id).await? {
                    for child in node.children {
                        tx.move_child(NodeId::ROOT, Some(DETACHED_ROLE), None, child).await?;
                    }
                    tx.apply(&self.op).await?;
                }
            }
            Operation::SetProperty { id, .. }
            | Operation::SetReference { id, .. }
            | Operation::SetConcept { id, .. } => {
                if tx.contains(*id).await? {
                    tx.apply(&self.op).await?;
                }
            }
            Operation::BulkSubtreeAdd { parent, root, .. } => {
                if tx.contains(*parent).await? && !tx.contains(*root).await? {
                    tx.apply(&self.op).await?;
                }
            }
            Operation::Revert { .. } | Operation::Undo { .. } | Operation::NoOp => {}
        }

        let applied = tx.operations()[start..].to_vec();
        if applied.is_empty() {
            Ok(vec![Operation::NoOp])
        } else {
            Ok(applied)
        }
    }

    /// Where an added or moved node goes: last if it was last, next to a
    /// surviving neighbour, at the recorded index if neither survives, or
    /// into the detached area if the parent is gone.
    async fn placement(
        &self,
        tx: &WriteTransaction,
        parent: NodeId,
        role: Option<&str>,
        index: usize,
        id: NodeId,
    ) -> TreeResult<(NodeId, Option<String>, Option<usize>)> {
        if !tx.contains(parent).await? {
            return Ok((NodeId::ROOT, Some(DETACHED_ROLE.to_owned()), None));
        }
        let mut siblings = tx.children_in_role(parent, role).await?;
        siblings.retain(|c| *c != id);
        let position = |n: NodeId| siblings.iter().position(|c| *c == n);

        let index = match self.neighbours {
            Some(Neighbours { after: None, .. }) => siblings.len(),
            Some(Neighbours { after, before }) => {
                match (after.and_then(position), before.and_then(position)) {
                    (Some(i), _) => i,
                    (None, Some(i)) => i + 1,
                    (None, None) => index.min(siblings.len()),
                }
            }
            None => index.min(siblings.len()),
        };
        Ok((parent, role.map(str::to_owned), Some(index)))
    }
}
