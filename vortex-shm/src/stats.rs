//! Per-peer request statistics stored in the zone.
//!
//! Each peer set owns one block: a small header repeating its [`PeerKey`], followed by
//! one [`PeerStats`] record per peer. Handles cache only the block offset; every read
//! and write goes back to the zone under the lock, and checks the header first so a
//! handle to an evicted block is refused instead of touching someone else's data.

use core::mem;
use core::num::NonZeroU32;

use vortex_core::{PeerKey, PeerSet};

use crate::error::ZoneError;
use crate::index::IndexNode;
use crate::offset::{Arena, ZoneOffset};
use crate::zone::{Zone, ZoneGuard};

// odd, so it never matches a chunk offset stored at the same place in an index node
const BLOCK_TAG: u32 = 0x5653_4231;

/// Live statistics of one backend peer, shared by every worker.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Requests currently being served
    pub in_flight: u64,
    /// Requests ever started; never decreases
    pub total_requests: u64,
    /// Sequence number of the most recent request
    pub last_request_id: u64,
    /// Requests that failed
    pub fails: u64,
    /// Effective weight
    pub weight: i64,
}

impl PeerStats {
    /// Statistics of a peer nobody has used yet.
    pub fn baseline(weight: u32) -> Self {
        Self {
            weight: i64::from(weight),
            ..Self::default()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BlockHeader {
    key: PeerKey,
    peers: u32,
    tag: u32,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();
const RECORD_SIZE: usize = mem::size_of::<PeerStats>();

/// Bytes needed for the block of a set with `peers` peers.
pub fn block_size(peers: usize) -> usize {
    HEADER_SIZE + RECORD_SIZE * peers
}

/// Where a peer set's statistics live in the zone.
///
/// Valid in every process mapping the zone. Goes stale when the set is evicted, which
/// every access detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsHandle {
    key: PeerKey,
    block: ZoneOffset,
    peers: u32,
}

impl StatsHandle {
    pub(crate) fn from_node(node: &IndexNode) -> Result<Self, ZoneError> {
        Ok(Self {
            key: node.key,
            block: ZoneOffset::new(node.block).ok_or(ZoneError::Corrupted("index node without a block"))?,
            peers: node.peers,
        })
    }

    /// The owning peer set.
    pub fn key(&self) -> PeerKey {
        self.key
    }

    /// Offset of the block.
    pub fn block(&self) -> ZoneOffset {
        self.block
    }

    /// Number of peers in the block.
    pub fn peers(&self) -> usize {
        self.peers as usize
    }

    fn record(&self, peer: usize) -> Result<u32, ZoneError> {
        if peer >= self.peers() {
            return Err(ZoneError::NoSuchPeer {
                index: peer,
                peers: self.peers(),
            });
        }
        let at = HEADER_SIZE + RECORD_SIZE * peer;
        self.block
            .get()
            .checked_add(at as u32)
            .ok_or(ZoneError::Corrupted("statistics record past the zone"))
    }

    fn validate(&self, arena: &Arena) -> Result<(), ZoneError> {
        let header: BlockHeader = arena.load(self.block.get())?;
        if header.tag != BLOCK_TAG || header.key != self.key || header.peers != self.peers {
            return Err(ZoneError::StaleHandle(self.key));
        }
        Ok(())
    }
}

/// Write the header and baseline records of a freshly allocated block.
pub(crate) fn init_block(
    arena: &Arena,
    block: ZoneOffset,
    key: PeerKey,
    weights: &[u32],
) -> Result<StatsHandle, ZoneError> {
    let peers = u32::try_from(weights.len()).map_err(|_| ZoneError::RecordTooLarge(block_size(weights.len())))?;
    arena.store(
        block.get(),
        BlockHeader {
            key,
            peers,
            tag: BLOCK_TAG,
        },
    )?;
    let handle = StatsHandle { key, block, peers };
    for (peer, weight) in weights.iter().enumerate() {
        arena.store(handle.record(peer)?, PeerStats::baseline(*weight))?;
    }
    Ok(handle)
}

/// Wipe the header of a block about to be freed, so no handle to it validates again.
pub(crate) fn retire_block(arena: &Arena, handle: &StatsHandle) -> Result<(), ZoneError> {
    arena.zero(handle.block.get(), HEADER_SIZE)
}

pub(crate) fn any_in_flight(arena: &Arena, handle: &StatsHandle) -> Result<bool, ZoneError> {
    handle.validate(arena)?;
    for peer in 0..handle.peers() {
        let stats: PeerStats = arena.load(handle.record(peer)?)?;
        if stats.in_flight > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

impl ZoneGuard<'_> {
    /// Whether `handle` still points at its own block.
    pub fn is_current(&self, handle: &StatsHandle) -> Result<bool, ZoneError> {
        self.check()?;
        match handle.validate(&self.arena()) {
            Ok(()) => Ok(true),
            Err(ZoneError::StaleHandle(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Read one peer's record.
    pub fn stats(&self, handle: &StatsHandle, peer: usize) -> Result<PeerStats, ZoneError> {
        self.check()?;
        let arena = self.arena();
        handle.validate(&arena)?;
        arena.load(handle.record(peer)?)
    }

    /// Read every record of a set, in peer order.
    pub fn all_stats(&self, handle: &StatsHandle) -> Result<Vec<PeerStats>, ZoneError> {
        self.check()?;
        let arena = self.arena();
        handle.validate(&arena)?;
        (0..handle.peers())
            .map(|peer| arena.load(handle.record(peer)?))
            .collect()
    }

    fn modify<T>(
        &mut self,
        handle: &StatsHandle,
        peer: usize,
        f: impl FnOnce(&mut PeerStats) -> Result<T, ZoneError>,
    ) -> Result<T, ZoneError> {
        self.mutate(|guard| {
            let arena = guard.arena();
            handle.validate(&arena)?;
            let at = handle.record(peer)?;
            let mut stats: PeerStats = arena.load(at)?;
            let out = f(&mut stats)?;
            arena.store(at, stats)?;
            Ok(out)
        })
    }

    /// Replace a record. The request total may not go backwards.
    ///
    /// Also the way to clear in-flight counts left behind by a crashed worker.
    pub fn update_stats(&mut self, handle: &StatsHandle, peer: usize, stats: PeerStats) -> Result<(), ZoneError> {
        self.modify(handle, peer, |current| {
            if stats.total_requests < current.total_requests {
                return Err(ZoneError::InvalidUpdate("total request count decreased"));
            }
            *current = stats;
            Ok(())
        })
    }

    /// Count a request as started on `peer`, unless that would exceed `limit`.
    pub fn start_request(
        &mut self,
        handle: &StatsHandle,
        peer: usize,
        limit: Option<NonZeroU32>,
    ) -> Result<PeerStats, ZoneError> {
        let key = handle.key;
        self.modify(handle, peer, |stats| {
            if let Some(limit) = limit {
                if stats.in_flight >= u64::from(limit.get()) {
                    return Err(ZoneError::Saturated {
                        key,
                        peer,
                        limit: limit.get(),
                    });
                }
            }
            stats.in_flight += 1;
            stats.total_requests += 1;
            stats.last_request_id = stats.total_requests;
            Ok(*stats)
        })
    }

    /// Count a request on `peer` as finished.
    pub fn finish_request(&mut self, handle: &StatsHandle, peer: usize, failed: bool) -> Result<PeerStats, ZoneError> {
        self.modify(handle, peer, |stats| {
            stats.in_flight = stats
                .in_flight
                .checked_sub(1)
                .ok_or(ZoneError::InvalidUpdate("finishing a request that never started"))?;
            if failed {
                stats.fails += 1;
            }
            Ok(*stats)
        })
    }

    /// Count a failure that happened outside a tracked request.
    pub fn record_failure(&mut self, handle: &StatsHandle, peer: usize) -> Result<(), ZoneError> {
        self.modify(handle, peer, |stats| {
            stats.fails += 1;
            Ok(())
        })
    }

    /// Set the effective weight of a peer.
    pub fn set_weight(&mut self, handle: &StatsHandle, peer: usize, weight: i64) -> Result<(), ZoneError> {
        self.modify(handle, peer, |stats| {
            stats.weight = weight;
            Ok(())
        })
    }
}

impl Zone {
    /// The block of `set`, from this process's handle cache when still current.
    pub fn resolve(&self, guard: &mut ZoneGuard<'_>, set: &PeerSet) -> Result<StatsHandle, ZoneError> {
        if let Some(handle) = self.handles.get(&set.key).map(|h| *h) {
            if guard.is_current(&handle)? {
                return Ok(handle);
            }
            tracing::debug!(key = %set.key, zone = %self.name(), "dropping stale statistics handle");
            self.handles.remove(&set.key);
        }
        let handle = guard.find_or_create(set.key, &set.weights())?;
        self.handles.insert(set.key, handle);
        Ok(handle)
    }

    /// Current statistics of every peer in `set`.
    ///
    /// A zone too full to hold the set reports baseline statistics from the
    /// configured weights instead of failing.
    pub fn peer_stats(&self, set: &PeerSet) -> Result<Vec<PeerStats>, ZoneError> {
        let mut guard = self.lock()?;
        match self.resolve(&mut guard, set) {
            Ok(handle) => guard.all_stats(&handle),
            Err(ZoneError::OutOfSpace { requested }) => {
                tracing::warn!(
                    key = %set.key,
                    zone = %self.name(),
                    requested,
                    "zone exhausted, using baseline peer statistics"
                );
                Ok(set.weights().into_iter().map(PeerStats::baseline).collect())
            }
            Err(err) => Err(err),
        }
    }

    /// Start tracking a request to peer `peer` of `set`.
    ///
    /// The returned guard counts the request as finished when dropped.
    pub fn begin_request(&self, set: &PeerSet, peer: usize) -> Result<InFlight<'_>, ZoneError> {
        let backend = set.backends.get(peer).ok_or(ZoneError::NoSuchPeer {
            index: peer,
            peers: set.len(),
        })?;

        let mut guard = self.lock()?;
        let handle = self.resolve(&mut guard, set)?;
        let stats = guard.start_request(&handle, peer, backend.max_in_flight)?;
        tracing::trace!(key = %set.key, peer, request = stats.last_request_id, "request started");

        Ok(InFlight {
            zone: self,
            handle,
            peer,
            failed: false,
            done: false,
        })
    }
}

/// A request counted as in flight until this guard is finished or dropped.
///
/// The count is not tied to the process that started it. If a worker dies with a
/// request open, the count stays: the peer remains that much closer to its
/// `max_in_flight` limit and [`ZoneGuard::prune`] never evicts its set, until someone
/// writes corrected counters with [`ZoneGuard::update_stats`].
pub struct InFlight<'z> {
    zone: &'z Zone,
    handle: StatsHandle,
    peer: usize,
    failed: bool,
    done: bool,
}

impl InFlight<'_> {
    /// Record the request as failed when it finishes.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// Peer index the request went to.
    pub fn peer(&self) -> usize {
        self.peer
    }

    /// Finish now and return the peer's updated statistics.
    pub fn finish(mut self) -> Result<PeerStats, ZoneError> {
        self.done = true;
        self.complete()
    }

    fn complete(&self) -> Result<PeerStats, ZoneError> {
        let mut guard = self.zone.lock()?;
        guard.finish_request(&self.handle, self.peer, self.failed)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(err) = self.complete() {
            tracing::error!(key = %self.handle.key, peer = self.peer, %err, "failed to finish request");
        }
    }
}
