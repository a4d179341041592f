//! Routing module holding the active peer sets and their generation.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::UpstreamConfig;
use crate::domain::backend::{Backend, BackendId};
use crate::domain::peer::{PeerKey, PeerSet, SharedPeerSet};

/// A lock-free table of the configured peer sets.
///
/// Uses `ArcSwap` to allow atomic, zero-downtime hot reloads of the backend
/// topology without acquiring read locks on the hot path (like `RwLock` would).
/// Every reload bumps the generation, so statistics kept for the previous
/// topology live under different [`PeerKey`]s than the new ones.
#[derive(Debug)]
pub struct RoutingTable {
    generation: AtomicU64,
    sets: ArcSwap<Vec<SharedPeerSet>>,
}

impl RoutingTable {
    /// Create a routing table at generation 1 from the configured upstreams.
    pub fn new(upstreams: &[UpstreamConfig]) -> Self {
        Self {
            generation: AtomicU64::new(1),
            sets: ArcSwap::from_pointee(build_sets(1, upstreams)),
        }
    }

    /// Atomically replace every peer set (e.g., during config hot-reload).
    ///
    /// Returns the new generation.
    pub fn reload(&self, upstreams: &[UpstreamConfig]) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.sets.store(Arc::new(build_sets(generation, upstreams)));
        tracing::info!(generation, sets = upstreams.len(), "reloaded peer sets");
        generation
    }

    /// The generation of the most recent configuration.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Look up a peer set by its upstream name.
    pub fn peer_set(&self, name: &str) -> Option<SharedPeerSet> {
        self.sets.load().iter().find(|s| s.name == name).cloned()
    }

    /// Retrieve a snapshot of all current peer sets.
    pub fn snapshot(&self) -> Arc<Vec<SharedPeerSet>> {
        self.sets.load_full()
    }
}

fn build_sets(generation: u64, upstreams: &[UpstreamConfig]) -> Vec<SharedPeerSet> {
    upstreams
        .iter()
        .enumerate()
        .map(|(ordinal, upstream)| {
            let backends = upstream
                .backends
                .iter()
                .enumerate()
                .map(|(i, b)| {
                    Arc::new(
                        Backend::new(BackendId(i as u32), b.addr)
                            .with_weight(b.weight)
                            .with_max_in_flight(b.max_in_flight),
                    )
                })
                .collect();

            Arc::new(PeerSet {
                key: PeerKey::new(generation, ordinal as u64),
                name: upstream.name.clone(),
                zone: upstream.zone.clone(),
                backends,
            })
        })
        .collect()
}

/// A shared reference to the lock-free routing table.
pub type SharedRoutingTable = Arc<RoutingTable>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn upstream(name: &str, ports: &[u16]) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            zone: "stats".to_string(),
            backends: ports
                .iter()
                .map(|p| BackendConfig {
                    addr: ([127, 0, 0, 1], *p).into(),
                    weight: 2,
                    max_in_flight: None,
                })
                .collect(),
        }
    }

    #[test]
    fn sets_get_distinct_ordinals() {
        let table = RoutingTable::new(&[upstream("a", &[1, 2]), upstream("b", &[3])]);
        let a = table.peer_set("a").unwrap();
        let b = table.peer_set("b").unwrap();
        assert_eq!(a.key, PeerKey::new(1, 0));
        assert_eq!(b.key, PeerKey::new(1, 1));
        assert_eq!(a.weights(), vec![2, 2]);
        assert_eq!(b.backends[0].id, BackendId(0));
    }

    #[test]
    fn reload_bumps_generation() {
        let table = RoutingTable::new(&[upstream("a", &[1])]);
        let before = table.peer_set("a").unwrap();
        assert_eq!(table.reload(&[upstream("a", &[1, 2])]), 2);
        let after = table.peer_set("a").unwrap();

        assert_eq!(table.generation(), 2);
        assert_ne!(before.key, after.key);
        assert!(before.key < after.key);
        assert_eq!(after.len(), 2);
        // old snapshots stay valid for in-flight users
        assert_eq!(before.len(), 1);
    }
}
