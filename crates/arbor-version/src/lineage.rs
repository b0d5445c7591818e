//! Lineage queries over the version graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use futures::future::try_join_all;

use arbor_types::ObjectHash;

use crate::error::VersionResult;
use crate::version::Version;

/// The most recent version both `left` and `right` are based on.
///
/// Both base-version chains are walked alternately, one step each, until a
/// version seen on one side shows up on the other. Merge versions use the
/// common base of their merged versions as their base, so the walk never
/// has to branch.
pub async fn common_base(left: &Version, right: &Version) -> VersionResult<Option<Version>> {
    let mut left = Some(left.clone());
    let mut right = Some(right.clone());
    let mut left_seen: HashSet<ObjectHash> = HashSet::new();
    let mut right_seen: HashSet<ObjectHash> = HashSet::new();

    while left.is_some() || right.is_some() {
        if let Some(l) = &left {
            left_seen.insert(l.hash());
        }
        if let Some(r) = &right {
            right_seen.insert(r.hash());
        }
        if let Some(l) = &left {
            if right_seen.contains(&l.hash()) {
                return Ok(left);
            }
        }
        if let Some(r) = &right {
            if left_seen.contains(&r.hash()) {
                return Ok(right);
            }
        }
        left = match left {
            Some(l) => l.base_version().await?,
            None => None,
        };
        right = match right {
            Some(r) => r.base_version().await?,
            None => None,
        };
    }
    Ok(None)
}

/// Up to `limit` versions of the history of `version`, newest first.
///
/// The walk is breadth-first over [`Version::parents`] and includes
/// `version` itself.
pub async fn history(version: &Version, limit: usize) -> VersionResult<Vec<Version>> {
    let mut result = Vec::new();
    let mut seen = HashSet::from([version.hash()]);
    let mut queue = VecDeque::from([version.clone()]);
    while let Some(current) = queue.pop_front() {
        if result.len() >= limit {
            break;
        }
        for parent in current.parents() {
            if seen.insert(parent) {
                queue.push_back(Version::load(current.loader().clone(), &parent).await?);
            }
        }
        result.push(current);
    }
    Ok(result)
}

/// Whether `ancestor` is `version` or one of its predecessors.
pub async fn is_ancestor(ancestor: &ObjectHash, version: &Version) -> VersionResult<bool> {
    let mut seen = HashSet::from([version.hash()]);
    let mut frontier = vec![version.clone()];
    while !frontier.is_empty() {
        if frontier.iter().any(|v| v.hash() == *ancestor) {
            return Ok(true);
        }
        let parents: Vec<ObjectHash> = frontier
            .iter()
            .flat_map(Version::parents)
            .filter(|p| seen.insert(*p))
            .collect();
        let loader = frontier[0].loader().clone();
        frontier = try_join_all(parents.iter().map(|p| Version::load(loader.clone(), p))).await?;
    }
    Ok(false)
}

/// The non-merge versions reachable from `left` or `right` but not through
/// `common_base`, in a deterministic topological order.
///
/// Predecessors always come first; among versions that are ready at the
/// same time the lower id wins (hash breaks ties). Merge versions only
/// contribute their edges.
pub async fn linear_history(
    common_base: Option<&ObjectHash>,
    left: &Version,
    right: &Version,
) -> VersionResult<Vec<Version>> {
    // Collect the graph between the tips and the common base, level by level.
    let mut versions: HashMap<ObjectHash, Version> = HashMap::new();
    let mut frontier: Vec<Version> = Vec::new();
    for tip in [left, right] {
        if Some(&tip.hash()) != common_base && !versions.contains_key(&tip.hash()) {
            versions.insert(tip.hash(), tip.clone());
            frontier.push(tip.clone());
        }
    }
    while !frontier.is_empty() {
        let mut next: Vec<ObjectHash> = Vec::new();
        for v in &frontier {
            for parent in v.parents() {
                if Some(&parent) != common_base && !versions.contains_key(&parent) && !next.contains(&parent) {
                    next.push(parent);
                }
            }
        }
        let loader = frontier[0].loader().clone();
        frontier = try_join_all(next.iter().map(|h| Version::load(loader.clone(), h))).await?;
        for v in &frontier {
            versions.insert(v.hash(), v.clone());
        }
    }

    // Kahn's algorithm; merges are released before regular versions.
    let mut pending: HashMap<ObjectHash, usize> = HashMap::new();
    let mut successors: HashMap<ObjectHash, Vec<ObjectHash>> = HashMap::new();
    for (hash, v) in &versions {
        let inside: Vec<ObjectHash> = v
            .parents()
            .into_iter()
            .filter(|p| versions.contains_key(p))
            .collect();
        pending.insert(*hash, inside.len());
        for p in inside {
            successors.entry(p).or_default().push(*hash);
        }
    }

    let key = |v: &Version| Reverse((!v.is_merge(), v.id(), v.hash()));
    let mut ready: BinaryHeap<Reverse<(bool, u64, ObjectHash)>> = versions
        .values()
        .filter(|v| pending[&v.hash()] == 0)
        .map(key)
        .collect();

    let mut result = Vec::new();
    while let Some(Reverse((_, _, hash))) = ready.pop() {
        let v = &versions[&hash];
        if !v.is_merge() {
            result.push(v.clone());
        }
        for succ in successors.get(&hash).into_iter().flatten() {
            if let Some(count) = pending.get_mut(succ) {
                *count -= 1;
                if *count == 0 {
                    ready.push(key(&versions[succ]));
                }
            }
        }
    }
    Ok(result)
}
