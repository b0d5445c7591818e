//! Dropping undone and reverted versions from a linear history.

use std::collections::HashSet;

use arbor_types::ObjectHash;
use arbor_version::{linear_history, Version};

use crate::error::MergeResult;

/// Remove versions that are cancelled within `history`.
///
/// An undo version and the version it undoes are both dropped when both
/// are part of `history`. A revert version is dropped together with every
/// version it rolls back, provided all of them are part of `history`.
/// Walking newest first means that undoing an undo drops the first undo and
/// keeps the original version.
///
/// Cancellations that reach outside `history` stay in place; their
/// recorded inverse operations are replayed like any other edit.
pub async fn drop_cancelled(history: Vec<Version>) -> MergeResult<Vec<Version>> {
    let present: HashSet<ObjectHash> = history.iter().map(Version::hash).collect();
    let mut dropped: HashSet<ObjectHash> = HashSet::new();

    for version in history.iter().rev() {
        if dropped.contains(&version.hash()) {
            continue;
        }
        if let Some(undone) = version.undone_version().await? {
            if present.contains(&undone) && !dropped.contains(&undone) {
                dropped.insert(undone);
                dropped.insert(version.hash());
            }
        } else if let Some((latest_known, revert_to)) = version.reverted_range().await? {
            let latest = Version::load(version.loader().clone(), &latest_known).await?;
            let rolled_back = linear_history(Some(&revert_to), &latest, &latest).await?;
            let contained = rolled_back
                .iter()
                .all(|v| present.contains(&v.hash()) && !dropped.contains(&v.hash()));
            if contained {
                dropped.extend(rolled_back.iter().map(Version::hash));
                dropped.insert(version.hash());
            }
        }
    }

    Ok(history
        .into_iter()
        .filter(|v| !dropped.contains(&v.hash()))
        .collect())
}
