//! Keyed diff of role maps (properties, references).

use std::collections::BTreeMap;

/// The result of comparing two role maps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapDiff<V> {
    pub changes: Vec<MapChange<V>>,
}

impl<V> Default for MapDiff<V> {
    fn default() -> Self {
        Self { changes: Vec::new() }
    }
}

impl<V> MapDiff<V> {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Roles whose value differs, in role order.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(MapChange::role)
    }
}

/// One changed role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapChange<V> {
    Added { role: String, value: V },
    Removed { role: String, value: V },
    Modified { role: String, old: V, new: V },
}

impl<V> MapChange<V> {
    pub fn role(&self) -> &str {
        match self {
            Self::Added { role, .. } | Self::Removed { role, .. } | Self::Modified { role, .. } => role,
        }
    }
}

/// Compare two role maps.
///
/// Roles present only in `new` are `Added`, roles present only in `old` are
/// `Removed`, and roles present in both with different values are
/// `Modified`. Changes come out sorted by role.
pub fn diff_maps<V: Clone + PartialEq>(
    old: &BTreeMap<String, V>,
    new: &BTreeMap<String, V>,
) -> MapDiff<V> {
    let mut changes = Vec::new();
    for (role, old_value) in old {
        match new.get(role) {
            Some(new_value) if new_value != old_value => changes.push(MapChange::Modified {
                role: role.clone(),
                old: old_value.clone(),
                new: new_value.clone(),
            }),
            Some(_) => {}
            None => changes.push(MapChange::Removed {
                role: role.clone(),
                value: old_value.clone(),
            }),
        }
    }
    for (role, value) in new {
        if !old.contains_key(role) {
            changes.push(MapChange::Added {
                role: role.clone(),
                value: value.clone(),
            });
        }
    }
    changes.sort_by(|a, b| a.role().cmp(b.role()));
    MapDiff { changes }
}
