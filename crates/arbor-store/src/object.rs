use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use arbor_crypto::ContentHasher;
use arbor_types::ObjectHash;

use crate::error::{StoreError, StoreResult};

/// The kind of a stored record.
///
/// The kind selects the hashing domain and is the type tag that leads every
/// encoded blob, so a reader can dispatch deserialization without context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// A node record: id, concept, containment, children, properties, references.
    Node,
    /// A hash-trie node of the node index.
    TrieNode,
    /// A tree record: repository id plus trie root.
    Tree,
    /// A version record.
    Version,
    /// An out-of-line operation list referenced by a version.
    Operations,
}

impl ObjectKind {
    /// Wire tag of this kind.
    pub const fn tag(self) -> u8 {
        match self {
            Self::Node => 0x01,
            Self::TrieNode => 0x02,
            Self::Tree => 0x03,
            Self::Version => 0x04,
            Self::Operations => 0x05,
        }
    }

    pub fn from_tag(tag: u8) -> StoreResult<Self> {
        match tag {
            0x01 => Ok(Self::Node),
            0x02 => Ok(Self::TrieNode),
            0x03 => Ok(Self::Tree),
            0x04 => Ok(Self::Version),
            0x05 => Ok(Self::Operations),
            other => Err(StoreError::UnknownKind(other)),
        }
    }

    /// The hashing domain of this kind.
    pub const fn hasher(self) -> ContentHasher {
        match self {
            Self::Node => ContentHasher::NODE,
            Self::TrieNode => ContentHasher::TRIE,
            Self::Tree => ContentHasher::TREE,
            Self::Version => ContentHasher::VERSION,
            Self::Operations => ContentHasher::OPERATIONS,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::TrieNode => write!(f, "trie-node"),
            Self::Tree => write!(f, "tree"),
            Self::Version => write!(f, "version"),
            Self::Operations => write!(f, "operations"),
        }
    }
}

/// A stored object: kind tag + canonical serialized data.
///
/// `StoredObject` is the unit of storage and transfer. Backends never
/// interpret `data`; they key it by [`StoredObject::compute_hash`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub kind: ObjectKind,
    pub data: Vec<u8>,
}

impl StoredObject {
    pub fn new(kind: ObjectKind, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    /// Content hash under the domain of this object's kind.
    pub fn compute_hash(&self) -> ObjectHash {
        self.kind.hasher().hash(&self.data)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check that this object is the one stored under `expected`.
    pub fn verify(&self, expected: &ObjectHash) -> StoreResult<()> {
        let computed = self.compute_hash();
        if computed != *expected {
            return Err(StoreError::HashMismatch {
                expected: *expected,
                computed,
            });
        }
        Ok(())
    }

    /// Self-describing wire form: `[kind tag][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.data.len());
        buf.push(self.kind.tag());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode the wire form produced by [`StoredObject::encode`].
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| StoreError::Serialization("empty object blob".into()))?;
        Ok(Self::new(ObjectKind::from_tag(tag)?, payload.to_vec()))
    }
}

/// Encode a batch of objects for a remote backend round trip.
pub fn encode_batch(objects: &[StoredObject]) -> StoreResult<Vec<u8>> {
    let blobs: Vec<Vec<u8>> = objects.iter().map(StoredObject::encode).collect();
    bincode::serialize(&blobs).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a batch produced by [`encode_batch`].
pub fn decode_batch(bytes: &[u8]) -> StoreResult<Vec<StoredObject>> {
    let blobs: Vec<Vec<u8>> =
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
    blobs.iter().map(|b| StoredObject::decode(b)).collect()
}

/// A typed record with a canonical JSON serialization.
///
/// Implementors must only use ordered collections (`Vec`, `BTreeMap`) so the
/// serialization, and with it the hash, is a pure function of the value.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: ObjectKind;

    fn to_stored_object(&self) -> StoreResult<StoredObject> {
        let data =
            serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(StoredObject::new(Self::KIND, data))
    }

    fn from_stored_object(obj: &StoredObject) -> StoreResult<Self> {
        if obj.kind != Self::KIND {
            return Err(StoreError::CorruptObject {
                id: obj.compute_hash(),
                reason: format!("expected {}, got {}", Self::KIND, obj.kind),
            });
        }
        serde_json::from_slice(&obj.data).map_err(|e| StoreError::CorruptObject {
            id: obj.compute_hash(),
            reason: e.to_string(),
        })
    }

    /// Hash of the canonical serialization.
    fn compute_hash(&self) -> StoreResult<ObjectHash> {
        Ok(self.to_stored_object()?.compute_hash())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Label {
        name: String,
        tags: BTreeMap<String, String>,
    }

    impl Record for Label {
        const KIND: ObjectKind = ObjectKind::Node;
    }

    fn label(name: &str) -> Label {
        Label {
            name: name.into(),
            tags: BTreeMap::from([("k".to_string(), "v".to_string())]),
        }
    }

    // -----------------------------------------------------------------------
    // Kinds
    // -----------------------------------------------------------------------

    #[test]
    fn tags_are_unique_and_reversible() {
        let kinds = [
            ObjectKind::Node,
            ObjectKind::TrieNode,
            ObjectKind::Tree,
            ObjectKind::Version,
            ObjectKind::Operations,
        ];
        let mut tags: Vec<u8> = kinds.iter().map(|k| k.tag()).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), kinds.len());
        for kind in kinds {
            assert_eq!(ObjectKind::from_tag(kind.tag()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            ObjectKind::from_tag(0x7f),
            Err(StoreError::UnknownKind(0x7f))
        ));
    }

    #[test]
    fn kind_display() {
        assert_eq!(ObjectKind::TrieNode.to_string(), "trie-node");
        assert_eq!(ObjectKind::Operations.to_string(), "operations");
    }

    // -----------------------------------------------------------------------
    // Stored objects
    // -----------------------------------------------------------------------

    #[test]
    fn same_data_different_kind_different_hash() {
        let a = StoredObject::new(ObjectKind::Node, b"x".to_vec());
        let b = StoredObject::new(ObjectKind::Tree, b"x".to_vec());
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn verify_detects_wrong_key() {
        let obj = StoredObject::new(ObjectKind::Node, b"data".to_vec());
        assert!(obj.verify(&obj.compute_hash()).is_ok());
        let other = ObjectHash::digest(b"other");
        assert!(matches!(
            obj.verify(&other),
            Err(StoreError::HashMismatch { .. })
        ));
    }

    #[test]
    fn wire_form_leads_with_tag() {
        let obj = StoredObject::new(ObjectKind::Version, b"v".to_vec());
        let bytes = obj.encode();
        assert_eq!(bytes[0], ObjectKind::Version.tag());
        assert_eq!(StoredObject::decode(&bytes).unwrap(), obj);
    }

    #[test]
    fn decode_rejects_empty_and_unknown() {
        assert!(matches!(
            StoredObject::decode(&[]),
            Err(StoreError::Serialization(_))
        ));
        assert!(matches!(
            StoredObject::decode(&[0xee, 1, 2]),
            Err(StoreError::UnknownKind(0xee))
        ));
    }

    #[test]
    fn batch_codec_preserves_order() {
        let objects = vec![
            StoredObject::new(ObjectKind::Node, b"a".to_vec()),
            StoredObject::new(ObjectKind::TrieNode, b"b".to_vec()),
        ];
        let bytes = encode_batch(&objects).unwrap();
        assert_eq!(decode_batch(&bytes).unwrap(), objects);
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    #[test]
    fn record_roundtrip_and_kind_check() {
        let obj = label("a").to_stored_object().unwrap();
        assert_eq!(obj.kind, ObjectKind::Node);
        assert_eq!(Label::from_stored_object(&obj).unwrap(), label("a"));

        let wrong = StoredObject::new(ObjectKind::Tree, obj.data.clone());
        let err = Label::from_stored_object(&wrong).unwrap_err();
        assert!(err.to_string().contains("expected node, got tree"));
    }

    #[test]
    fn structurally_equal_records_share_hash() {
        assert_eq!(
            label("same").compute_hash().unwrap(),
            label("same").compute_hash().unwrap()
        );
        assert_ne!(
            label("same").compute_hash().unwrap(),
            label("other").compute_hash().unwrap()
        );
    }

    #[test]
    fn garbage_payload_is_corrupt() {
        let obj = StoredObject::new(ObjectKind::Node, b"{not json".to_vec());
        assert!(matches!(
            Label::from_stored_object(&obj),
            Err(StoreError::CorruptObject { .. })
        ));
    }
}
