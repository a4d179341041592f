//! Peer set identities.
//!
//! Every worker process builds its own in-memory [`PeerSet`] objects from the same
//! configuration, so the identity used to find a peer set's shared statistics must not
//! depend on anything process-local such as an address. [`PeerKey`] combines the
//! configuration generation with the peer set's ordinal inside that configuration.

use std::fmt;
use std::sync::Arc;

use crate::domain::backend::SharedBackend;

/// Identity of a logical peer set across reloads and processes.
///
/// Ordering is by generation first, then by set id, which is the order the shared
/// index keeps its nodes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(C)]
pub struct PeerKey {
    /// Configuration generation, bumped on every reload
    pub generation: u64,
    /// Ordinal of the peer set within its generation
    pub set_id: u64,
}

impl PeerKey {
    /// Build a key from its two components.
    pub const fn new(generation: u64, set_id: u64) -> Self {
        Self { generation, set_id }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.set_id)
    }
}

/// A named group of backends sharing one statistics block.
#[derive(Debug)]
pub struct PeerSet {
    /// Identity of this set in the shared index
    pub key: PeerKey,
    /// Upstream name from the configuration
    pub name: String,
    /// Name of the zone holding this set's statistics
    pub zone: String,
    /// The backends, in configuration order
    pub backends: Vec<SharedBackend>,
}

impl PeerSet {
    /// Configured weights, one per backend, in backend order.
    pub fn weights(&self) -> Vec<u32> {
        self.backends.iter().map(|b| b.weight).collect()
    }

    /// Number of backends in the set.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the set has no backends.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// A thread-safe reference to a PeerSet.
pub type SharedPeerSet = Arc<PeerSet>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generation_orders_before_set_id() {
        let old = PeerKey::new(1, 9);
        let new = PeerKey::new(2, 0);
        assert!(old < new);
        assert!(PeerKey::new(2, 0) < PeerKey::new(2, 1));
    }

    proptest! {
        #[test]
        fn ordering_matches_tuple_ordering(a in any::<(u64, u64)>(), b in any::<(u64, u64)>()) {
            let ka = PeerKey::new(a.0, a.1);
            let kb = PeerKey::new(b.0, b.1);
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
        }
    }
}
