use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::node::NodeId;

/// Source of globally unique node ids.
///
/// The store and the write transaction never invent ids; every id comes from
/// an implementation of this trait owned by the writer.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> NodeId;
}

/// Client-namespaced monotonic id generator.
///
/// The upper 32 bits hold the client id, the lower 32 bits a per-client
/// counter. Two clients with different ids can never collide, and the ids of
/// one client increase monotonically, so version ids drawn from the same
/// generator sort by creation order.
pub struct ClientIdGenerator {
    client_id: u32,
    counter: AtomicU64,
}

impl ClientIdGenerator {
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            counter: AtomicU64::new(0),
        }
    }

    /// A generator with a random client id.
    pub fn random() -> Self {
        Self::new(rand::random::<u32>().max(1))
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }
}

impl IdGenerator for ClientIdGenerator {
    fn generate(&self) -> NodeId {
        loop {
            let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            assert!(n <= u32::MAX as u64, "id space of client {} exhausted", self.client_id);
            let raw = ((self.client_id as u64) << 32) | n;
            // Ids 0 and 1 are reserved (invalid, root) in the namespace of client 0.
            if raw > NodeId::ROOT.as_u64() {
                return NodeId::new(raw);
            }
        }
    }
}

impl fmt::Debug for ClientIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdGenerator")
            .field("client_id", &self.client_id)
            .field("allocated", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_are_namespaced_by_client() {
        let gen = ClientIdGenerator::new(7);
        let id = gen.generate();
        assert_eq!(id.as_u64() >> 32, 7);
        assert_eq!(id.as_u64() & 0xffff_ffff, 1);
    }

    #[test]
    fn ids_increase_monotonically() {
        let gen = ClientIdGenerator::new(3);
        let a = gen.generate();
        let b = gen.generate();
        assert!(b > a);
    }

    #[test]
    fn client_zero_skips_reserved_ids() {
        let gen = ClientIdGenerator::new(0);
        let first = gen.generate();
        assert_eq!(first.as_u64(), 2);
    }

    #[test]
    fn different_clients_never_collide() {
        let a = ClientIdGenerator::new(1);
        let b = ClientIdGenerator::new(2);
        let ids: HashSet<NodeId> = (0..100)
            .flat_map(|_| [a.generate(), b.generate()])
            .collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn random_generator_has_nonzero_client() {
        assert_ne!(ClientIdGenerator::random().client_id(), 0);
    }
}
