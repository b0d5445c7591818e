use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::repository::RepositoryId;

/// Identity of a node within a repository.
///
/// Ids are never allocated by the store; writers obtain them from an
/// [`IdGenerator`](crate::IdGenerator). Id `0` is invalid and id `1` is the
/// root node present in every tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// The root node of every tree.
    pub const ROOT: NodeId = NodeId(1);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = TypeError;

    /// Parses the hex form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = u64::from_str_radix(s, 16).map_err(|e| TypeError::InvalidNodeId(format!("{s}: {e}")))?;
        if raw == 0 {
            return Err(TypeError::InvalidNodeId("0 is reserved".into()));
        }
        Ok(Self(raw))
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Opaque type tag of a node (its concept).
///
/// The store never interprets concepts; resolving them against a schema is
/// the synchronizer's job.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptRef(String);

impl ConceptRef {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConceptRef {
    fn from(uid: &str) -> Self {
        Self(uid.to_owned())
    }
}

impl From<String> for ConceptRef {
    fn from(uid: String) -> Self {
        Self(uid)
    }
}

impl fmt::Debug for ConceptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConceptRef({})", self.0)
    }
}

impl fmt::Display for ConceptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target of a reference role.
///
/// A reference may point into the same tree, into another repository, or to
/// something the writer could not resolve at all (kept verbatim so it can be
/// resolved by a later synchronization).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeReference {
    /// A node of the tree holding the reference.
    Local(NodeId),
    /// A node of another repository.
    Global { repository: RepositoryId, node: NodeId },
    /// An unresolved reference in its external serialized form.
    Serialized(String),
}

impl NodeReference {
    /// The local target, if this reference points into the same tree.
    pub fn local_target(&self) -> Option<NodeId> {
        match self {
            Self::Local(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for NodeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local:{id}"),
            Self::Global { repository, node } => write!(f, "global:{repository}/{node}"),
            Self::Serialized(s) => f.write_str(s),
        }
    }
}

impl FromStr for NodeReference {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix("local:") {
            return Ok(Self::Local(id.parse()?));
        }
        if let Some(rest) = s.strip_prefix("global:") {
            let (repository, node) = rest
                .rsplit_once('/')
                .ok_or_else(|| TypeError::InvalidReference(s.to_string()))?;
            return Ok(Self::Global {
                repository: repository.parse()?,
                node: node.parse()?,
            });
        }
        if s.is_empty() {
            return Err(TypeError::InvalidReference("empty reference".into()));
        }
        Ok(Self::Serialized(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_id() {
        assert!(NodeId::ROOT.is_root());
        assert_eq!(NodeId::ROOT.as_u64(), 1);
        assert!(!NodeId::new(2).is_root());
    }

    #[test]
    fn node_id_hex_form() {
        let id = NodeId::new(0x7fff_0000_0000_002a);
        assert_eq!(id.to_string(), "7fff00000000002a");
        assert_eq!(id.to_string().parse::<NodeId>().unwrap(), id);
        assert!("0".parse::<NodeId>().is_err());
        assert!("xyz".parse::<NodeId>().is_err());
    }

    #[test]
    fn node_id_serializes_as_number() {
        let json = serde_json::to_string(&NodeId::new(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn reference_string_forms() {
        let local = NodeReference::Local(NodeId::new(0x10));
        assert_eq!(local.to_string(), "local:10");
        assert_eq!("local:10".parse::<NodeReference>().unwrap(), local);

        let global = NodeReference::Global {
            repository: RepositoryId::new("models").unwrap(),
            node: NodeId::new(0xab),
        };
        assert_eq!(global.to_string(), "global:models/ab");
        assert_eq!(global.to_string().parse::<NodeReference>().unwrap(), global);

        let other: NodeReference = "mps:r:1234".parse().unwrap();
        assert_eq!(other, NodeReference::Serialized("mps:r:1234".into()));
        assert_eq!(other.local_target(), None);
    }

    #[test]
    fn empty_reference_rejected() {
        assert!("".parse::<NodeReference>().is_err());
    }
}
