//! Zone lifecycle and the locked view of a zone.
//!
//! A zone moves through these stages:
//!
//! 1. **Created**: [`SharedZone::create`] validates the declaration and creates the
//!    shared memory object, once, at configuration time.
//! 2. **Attached**: every worker calls [`SharedZone::attach`], which maps the object
//!    into that process.
//! 3. **Initialized**: whichever process first takes the zone lock and finds no
//!    header marker formats the header, writes the seed payload and runs the
//!    registered initializer. Everyone else sees the marker and skips this step.
//! 4. **Active**: all processes read and write through [`ZoneGuard`].
//! 5. **Destroyed**: [`SharedZone::destroy`] removes the object at shutdown.
//!
//! # Layout
//!
//! ```text
//! +------+-----+-----------+-----------------------------------------+
//! | lock | pad | ZoneMeta  |              slab heap                  |
//! +------+-----+-----------+-----------------------------------------+
//! 0      4     8           ZONE_HEADER_SIZE                     size
//! ```
//!
//! The lock word is the only field touched outside the lock. `ZoneMeta` and the heap
//! are only read or written by the lock holder.

use core::mem;
use core::sync::atomic::AtomicU32;
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use nix::errno::Errno;
use vortex_core::{PeerKey, ZoneConfig};

use crate::error::ZoneError;
use crate::index::{Index, IndexRoot, IndexShape, NODE_SIZE};
use crate::offset::{Arena, ZoneOffset};
use crate::region::ShmRegion;
use crate::slab::{SlabAllocator, SlabState, SIZE_CLASSES};
use crate::spinlock::{OwnerId, OwnerProbe, ProcessProbe, SpinLock, SpinPolicy};
use crate::stats::{self, StatsHandle};

const ZONE_MAGIC: u32 = 0x5654_5a31;
const LAYOUT_VERSION: u32 = 1;
const META_OFFSET: usize = 8;

/// Bytes reserved for the header; the heap starts here.
pub const ZONE_HEADER_SIZE: usize = (META_OFFSET + mem::size_of::<ZoneMeta>()).div_ceil(64) * 64;

/// Smallest zone accepted: the header plus room for one index node.
pub const MIN_ZONE_SIZE: usize = ZONE_HEADER_SIZE + 64;

/// Hook run once per zone per server start, by the process that initializes it.
pub type Initializer = Arc<dyn Fn(&mut ZoneGuard<'_>) -> Result<(), ZoneError> + Send + Sync>;

/// Lifecycle stage of a zone, as reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    /// Declared but not yet created
    Unconfigured,
    /// The shared object exists
    Created,
    /// Mapped by the current process
    Attached,
    /// Header written by the current process
    Initialized,
    /// Ready for use
    Active,
    /// The shared object is gone
    Destroyed,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct ZoneMeta {
    magic: u32,
    version: u32,
    size: u32,
    mutating: u32,
    poisoned: u32,
    recoveries: u32,
    initializer: u32,
    seed: u32,
    seed_len: u32,
    _pad: u32,
    index: IndexRoot,
    slab: SlabState,
}

/// A zone created at configuration time, not yet mapped by this process.
pub struct SharedZone {
    name: String,
    os_name: CString,
    size: usize,
    seed: Vec<u8>,
    policy: SpinPolicy,
    initializer: Option<Initializer>,
}

/// Largest slab chunk a heap of `heap` bytes can hand out.
fn largest_chunk(heap: usize) -> usize {
    SIZE_CLASSES
        .iter()
        .map(|c| *c as usize)
        .take_while(|c| *c <= heap)
        .last()
        .unwrap_or(0)
}

impl fmt::Debug for SharedZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedZone")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("seed_len", &self.seed.len())
            .field("policy", &self.policy)
            .field("initializer", &self.initializer.is_some())
            .finish()
    }
}

impl SharedZone {
    /// Validate `config` and create the shared object.
    ///
    /// Every failure here is a configuration error: the name is invalid or taken, the
    /// size cannot hold the header, or the seed does not fit in the heap.
    pub fn create(config: &ZoneConfig) -> Result<Self, ZoneError> {
        config.validate()?;

        let size = config.size.bytes() as usize;
        if size < MIN_ZONE_SIZE {
            return Err(ZoneError::TooSmall {
                name: config.name.clone(),
                size,
                min: MIN_ZONE_SIZE,
            });
        }

        let seed = config.seed.clone().unwrap_or_default().into_bytes();
        let max = largest_chunk(size - ZONE_HEADER_SIZE);
        if seed.len() > max {
            return Err(ZoneError::SeedTooLarge {
                name: config.name.clone(),
                len: seed.len(),
                max,
            });
        }

        let os_name = CString::new(format!("/vortex.{}", config.name))
            .map_err(|_| vortex_core::ConfigError::InvalidZoneName(config.name.clone()))?;

        match ShmRegion::create(&os_name, size) {
            Ok(()) => {}
            Err(Errno::EEXIST) => return Err(ZoneError::NameInUse(config.name.clone())),
            Err(err) => return Err(err.into()),
        }
        tracing::info!(zone = %config.name, size, state = ?ZoneState::Created, "created shared zone");

        Ok(Self {
            name: config.name.clone(),
            os_name,
            size,
            seed,
            policy: SpinPolicy::default(),
            initializer: None,
        })
    }

    /// Register the hook the initializing process runs after formatting the header.
    pub fn with_initializer<F>(mut self, init: F) -> Self
    where
        F: Fn(&mut ZoneGuard<'_>) -> Result<(), ZoneError> + Send + Sync + 'static,
    {
        self.set_initializer(init);
        self
    }

    /// Register or replace the initializer of an already registered zone.
    pub fn set_initializer<F>(&mut self, init: F)
    where
        F: Fn(&mut ZoneGuard<'_>) -> Result<(), ZoneError> + Send + Sync + 'static,
    {
        let init: Initializer = Arc::new(init);
        if self.initializer.replace(init).is_some() {
            tracing::debug!(zone = %self.name, "replaced zone initializer");
        }
    }

    /// Lock timing used by zones attached from here.
    pub fn with_policy(mut self, policy: SpinPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Map the zone as the current process, initializing it if nobody has.
    pub fn attach(&self) -> Result<Zone, ZoneError> {
        self.attach_as(OwnerId::current(), Box::new(ProcessProbe))
    }

    /// Map the zone with an explicit owner id and liveness probe.
    ///
    /// Used to run several independent lock owners inside one process.
    pub fn attach_as(&self, owner: OwnerId, probe: Box<dyn OwnerProbe>) -> Result<Zone, ZoneError> {
        let region = match ShmRegion::open(&self.os_name, self.size) {
            Ok(region) => region,
            Err(ZoneError::Sys(Errno::ENOENT)) => return Err(ZoneError::NotCreated(self.name.clone())),
            Err(err) => return Err(err),
        };
        let arena = region.arena();
        let mut zone = Zone {
            name: self.name.clone(),
            region,
            arena,
            owner,
            probe,
            policy: self.policy,
            handles: DashMap::new(),
            initialized_here: false,
        };
        tracing::debug!(zone = %self.name, %owner, state = ?ZoneState::Attached, "attached shared zone");

        zone.initialized_here = self.initialize(&zone)?;
        tracing::debug!(zone = %self.name, %owner, state = ?ZoneState::Active, "zone ready");
        Ok(zone)
    }

    /// Format the zone unless the header marker says it already is. Returns whether
    /// this call did the work.
    fn initialize(&self, zone: &Zone) -> Result<bool, ZoneError> {
        let mut guard = zone.lock()?;

        let meta = *guard.meta();
        if meta.magic == ZONE_MAGIC {
            if meta.version != LAYOUT_VERSION || meta.size as usize != self.size {
                return Err(ZoneError::Corrupted("zone header does not match its declaration"));
            }
            return Ok(false);
        }

        guard.initializing = true;
        guard.format(&self.seed)?;
        if let Some(init) = &self.initializer {
            init(&mut guard)?;
        }
        guard.meta().magic = ZONE_MAGIC;
        guard.initializing = false;

        tracing::info!(
            zone = %self.name,
            owner = %zone.owner,
            state = ?ZoneState::Initialized,
            "initialized shared zone"
        );
        Ok(true)
    }

    /// Remove the shared object. Existing mappings stay valid until dropped.
    pub fn destroy(self) -> Result<(), ZoneError> {
        match ShmRegion::unlink(&self.os_name) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(err) => return Err(err.into()),
        }
        tracing::info!(zone = %self.name, state = ?ZoneState::Destroyed, "destroyed shared zone");
        Ok(())
    }
}

/// All zones of one configuration, keyed by name.
#[derive(Debug, Default)]
pub struct ZoneRegistry {
    zones: Vec<SharedZone>,
}

impl ZoneRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create every zone in `configs`. On failure the zones created so far are removed
    /// again.
    pub fn from_config(configs: &[ZoneConfig]) -> Result<Self, ZoneError> {
        let mut registry = Self::new();
        for config in configs {
            if let Err(err) = registry.create(config).map(|_| ()) {
                if let Err(cleanup) = registry.destroy_all() {
                    tracing::warn!(%cleanup, "failed to remove zones after a configuration error");
                }
                return Err(err);
            }
        }
        Ok(registry)
    }

    /// Create and register one zone.
    pub fn create(&mut self, config: &ZoneConfig) -> Result<&mut SharedZone, ZoneError> {
        if self.get(&config.name).is_some() {
            return Err(ZoneError::DuplicateName(config.name.clone()));
        }
        self.zones.push(SharedZone::create(config)?);
        let last = self.zones.len() - 1;
        Ok(&mut self.zones[last])
    }

    /// Look up a zone by name.
    pub fn get(&self, name: &str) -> Option<&SharedZone> {
        self.zones.iter().find(|z| z.name == name)
    }

    /// Look up a zone by name for registering hooks.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut SharedZone> {
        self.zones.iter_mut().find(|z| z.name == name)
    }

    /// All registered zones.
    pub fn iter(&self) -> impl Iterator<Item = &SharedZone> {
        self.zones.iter()
    }

    /// Destroy every zone, returning the first failure.
    pub fn destroy_all(self) -> Result<(), ZoneError> {
        let mut first = None;
        for zone in self.zones {
            if let Err(err) = zone.destroy() {
                tracing::error!(%err, "failed to destroy zone");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// A zone mapped into the current process.
pub struct Zone {
    name: String,
    // keeps the mapping behind `arena` alive
    #[allow(dead_code)]
    region: ShmRegion,
    arena: Arena,
    owner: OwnerId,
    probe: Box<dyn OwnerProbe>,
    policy: SpinPolicy,
    pub(crate) handles: DashMap<PeerKey, StatsHandle>,
    initialized_here: bool,
}

// SAFETY: `arena` points into `region`, which is shared memory owned by this value.
// Everything behind it is accessed through the lock word or while holding the lock.
unsafe impl Send for Zone {}
unsafe impl Sync for Zone {}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("name", &self.name)
            .field("size", &self.arena.len())
            .field("owner", &self.owner)
            .finish()
    }
}

impl Zone {
    /// The zone name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lock owner id this mapping uses.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.arena.len()
    }

    /// Whether attaching this mapping ran the initializer.
    pub fn initialized_here(&self) -> bool {
        self.initialized_here
    }

    /// Who holds the lock right now, if anyone. Only a snapshot.
    pub fn lock_holder(&self) -> Option<OwnerId> {
        self.spinlock().holder()
    }

    /// The raw lock word behind [`ZoneGuard`].
    pub(crate) fn spinlock(&self) -> SpinLock<'_> {
        // SAFETY: offset 0 is reserved for the lock word, mapped and 4-byte aligned
        // (mappings are page aligned).
        let word = unsafe { &*(self.arena.base().as_ptr() as *const AtomicU32) };
        SpinLock::new(word)
    }

    /// Take the zone lock. Released when the guard drops.
    pub fn lock(&self) -> Result<ZoneGuard<'_>, ZoneError> {
        ZoneGuard::acquire(self)
    }
}

/// Counters describing how full a zone is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneUsage {
    /// Zone size in bytes
    pub size: usize,
    /// Heap bytes carved from the bump cursor
    pub carved: usize,
    /// Heap bytes never handed out
    pub untouched: usize,
    /// Live allocations
    pub live_allocations: u32,
    /// Peer sets in the index
    pub peer_sets: u32,
    /// Locks recovered from dead holders
    pub lock_recoveries: u32,
    /// Process that initialized the zone
    pub initialized_by: u32,
}

/// Exclusive access to a zone, across all processes, for as long as it lives.
pub struct ZoneGuard<'z> {
    zone: &'z Zone,
    initializing: bool,
}

impl<'z> ZoneGuard<'z> {
    fn acquire(zone: &'z Zone) -> Result<Self, ZoneError> {
        let acquired = zone
            .spinlock()
            .acquire(zone.owner, &zone.policy, zone.probe.as_ref())?;
        let mut guard = Self {
            zone,
            initializing: false,
        };

        let meta = guard.meta();
        if acquired.recovered.is_some() {
            meta.recoveries = meta.recoveries.saturating_add(1);
        }
        if meta.magic == ZONE_MAGIC && meta.mutating != 0 && meta.poisoned == 0 {
            meta.poisoned = 1;
            tracing::error!(
                zone = %zone.name,
                previous = ?acquired.recovered,
                "previous lock holder died mid-update, zone is poisoned"
            );
        }
        Ok(guard)
    }

    pub(crate) fn arena(&self) -> Arena {
        self.zone.arena
    }

    fn meta(&mut self) -> &mut ZoneMeta {
        // SAFETY: in bounds (zones are at least MIN_ZONE_SIZE), aligned, and only
        // touched by the lock holder, which is us for the guard's lifetime.
        unsafe {
            &mut *(self.zone.arena.base().as_ptr().add(META_OFFSET) as *mut ZoneMeta)
        }
    }

    fn meta_ref(&self) -> &ZoneMeta {
        // SAFETY: as in `meta`.
        unsafe { &*(self.zone.arena.base().as_ptr().add(META_OFFSET) as *const ZoneMeta) }
    }

    /// Fail unless the zone is initialized and consistent.
    pub(crate) fn check(&self) -> Result<(), ZoneError> {
        let meta = self.meta_ref();
        if meta.poisoned != 0 {
            return Err(ZoneError::Corrupted("zone poisoned by an interrupted update"));
        }
        if meta.magic != ZONE_MAGIC && !self.initializing {
            return Err(ZoneError::Corrupted("zone header is not initialized"));
        }
        Ok(())
    }

    /// Run a mutation of shared structures, flagging it so that a crash in the middle
    /// is seen by the next lock holder. Corruption found along the way poisons the zone.
    pub(crate) fn mutate<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ZoneError>,
    ) -> Result<T, ZoneError> {
        self.check()?;
        self.meta().mutating = 1;
        let result = f(self);
        if let Err(err) = &result {
            if err.is_corruption() {
                self.meta().poisoned = 1;
                tracing::error!(zone = %self.zone.name, %err, "zone poisoned");
            }
        }
        self.meta().mutating = 0;
        result
    }

    fn format(&mut self, seed: &[u8]) -> Result<(), ZoneError> {
        let arena = self.arena();
        let size = arena.len() as u32;
        let owner = self.zone.owner.get();

        let meta = self.meta();
        *meta = ZoneMeta {
            version: LAYOUT_VERSION,
            size,
            recoveries: meta.recoveries,
            initializer: owner,
            slab: SlabState::new(ZONE_HEADER_SIZE as u32, size),
            ..ZoneMeta::default()
        };

        if !seed.is_empty() {
            let at = SlabAllocator::new(&arena, &mut meta.slab).allocate(seed.len())?;
            // SAFETY: freshly allocated chunk of at least `seed.len()` bytes, lock held.
            unsafe { arena.bytes_mut(at.get(), seed.len())? }.copy_from_slice(seed);
            meta.seed = at.get();
            meta.seed_len = seed.len() as u32;
        }
        Ok(())
    }

    /// The seed payload written at initialization.
    pub fn seed(&self) -> Result<&[u8], ZoneError> {
        self.check()?;
        let meta = self.meta_ref();
        if meta.seed == 0 {
            return Ok(&[]);
        }
        // SAFETY: lock held; the seed chunk is never freed or written after init.
        unsafe { self.zone.arena.bytes(meta.seed, meta.seed_len as usize) }
    }

    /// Allocate a zeroed record of `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<ZoneOffset, ZoneError> {
        self.mutate(|guard| {
            let arena = guard.arena();
            SlabAllocator::new(&arena, &mut guard.meta().slab).allocate(size)
        })
    }

    /// Free a record obtained from [`allocate`](Self::allocate) with the same size.
    pub fn free(&mut self, offset: ZoneOffset, size: usize) -> Result<(), ZoneError> {
        self.mutate(|guard| {
            let arena = guard.arena();
            SlabAllocator::new(&arena, &mut guard.meta().slab).free(offset, size)
        })
    }

    /// Read access to a record.
    pub fn bytes(&self, offset: ZoneOffset, len: usize) -> Result<&[u8], ZoneError> {
        self.check()?;
        // SAFETY: lock held, and the slice borrows the guard.
        unsafe { self.zone.arena.bytes(offset.get(), len) }
    }

    /// Write access to a record.
    pub fn bytes_mut(&mut self, offset: ZoneOffset, len: usize) -> Result<&mut [u8], ZoneError> {
        self.check()?;
        // SAFETY: lock held, and the slice mutably borrows the guard.
        unsafe { self.zone.arena.bytes_mut(offset.get(), len) }
    }

    /// Look up the statistics block of a peer set.
    pub fn find(&self, key: &PeerKey) -> Result<Option<StatsHandle>, ZoneError> {
        self.check()?;
        let arena = self.arena();
        let mut root = self.meta_ref().index;
        let found = Index::new(&arena, &mut root).find(key)?;
        found
            .map(|(_, node)| StatsHandle::from_node(&node))
            .transpose()
    }

    /// Look up the statistics block of a peer set, creating it with one record per
    /// weight if absent.
    ///
    /// When the zone is full, blocks of older generations without in-flight requests
    /// are evicted and the insert is retried once.
    pub fn find_or_create(&mut self, key: PeerKey, weights: &[u32]) -> Result<StatsHandle, ZoneError> {
        if weights.is_empty() {
            return Err(ZoneError::InvalidUpdate("peer set without peers"));
        }
        if let Some(handle) = self.find(&key)? {
            if handle.peers() != weights.len() {
                return Err(ZoneError::Corrupted("peer identity shared by two different sets"));
            }
            return Ok(handle);
        }

        match self.insert(key, weights) {
            Err(ZoneError::OutOfSpace { requested }) => {
                let evicted = self.prune(key.generation)?;
                if evicted == 0 {
                    return Err(ZoneError::OutOfSpace { requested });
                }
                tracing::debug!(%key, evicted, "evicted old generations to make room");
                self.insert(key, weights)
            }
            other => other,
        }
    }

    fn insert(&mut self, key: PeerKey, weights: &[u32]) -> Result<StatsHandle, ZoneError> {
        self.mutate(|guard| {
            let arena = guard.arena();
            let meta = guard.meta();
            let size = stats::block_size(weights.len());

            let mut slab = SlabAllocator::new(&arena, &mut meta.slab);
            let block = slab.allocate(size)?;
            let node = match slab.allocate(NODE_SIZE) {
                Ok(node) => node,
                Err(err) => {
                    slab.free(block, size)?;
                    return Err(err);
                }
            };

            let handle = stats::init_block(&arena, block, key, weights)?;
            Index::new(&arena, &mut meta.index).insert(node, key, weights.len() as u32, block)?;
            tracing::debug!(%key, peers = weights.len(), %block, "created statistics block");
            Ok(handle)
        })
    }

    /// Drop a peer set's block from the index and free it. Returns whether it existed.
    pub fn remove(&mut self, key: &PeerKey) -> Result<bool, ZoneError> {
        self.mutate(|guard| guard.remove_locked(key))
    }

    fn remove_locked(&mut self, key: &PeerKey) -> Result<bool, ZoneError> {
        let arena = self.arena();
        let meta = self.meta();
        let Some((node_at, node)) = Index::new(&arena, &mut meta.index).remove(key)? else {
            return Ok(false);
        };
        let handle = StatsHandle::from_node(&node)?;
        stats::retire_block(&arena, &handle)?;

        let mut slab = SlabAllocator::new(&arena, &mut meta.slab);
        slab.free(handle.block(), stats::block_size(handle.peers()))?;
        slab.free(node_at, NODE_SIZE)?;
        self.zone.handles.remove(key);
        Ok(true)
    }

    /// Evict blocks of generations older than `current` that have no request in flight.
    pub fn prune(&mut self, current: u64) -> Result<usize, ZoneError> {
        self.mutate(|guard| {
            let arena = guard.arena();
            let entries = Index::new(&arena, &mut guard.meta().index).entries()?;

            let mut evicted = 0;
            for (_, node) in entries.iter().take_while(|(_, n)| n.key.generation < current) {
                let handle = StatsHandle::from_node(node)?;
                if stats::any_in_flight(&arena, &handle)? {
                    continue;
                }
                if guard.remove_locked(&node.key)? {
                    evicted += 1;
                }
            }
            Ok(evicted)
        })
    }

    /// Keys of all indexed peer sets, ascending.
    pub fn keys(&self) -> Result<Vec<PeerKey>, ZoneError> {
        self.check()?;
        let arena = self.arena();
        let mut root = self.meta_ref().index;
        let entries = Index::new(&arena, &mut root).entries()?;
        Ok(entries.into_iter().map(|(_, node)| node.key).collect())
    }

    /// Check the index for ordering, balance and orphaned nodes.
    pub fn verify(&self) -> Result<IndexShape, ZoneError> {
        self.check()?;
        let arena = self.arena();
        let mut root = self.meta_ref().index;
        Index::new(&arena, &mut root).verify()
    }

    /// Fill level and counters.
    pub fn usage(&self) -> ZoneUsage {
        let meta = self.meta_ref();
        ZoneUsage {
            size: self.zone.arena.len(),
            carved: meta.slab.carved(),
            untouched: meta.slab.untouched(),
            live_allocations: meta.slab.live(),
            peer_sets: meta.index.nodes(),
            lock_recoveries: meta.recoveries,
            initialized_by: meta.initializer,
        }
    }

    /// Whether an interrupted update has made the zone unusable.
    pub fn is_poisoned(&self) -> bool {
        self.meta_ref().poisoned != 0
    }
}

impl Drop for ZoneGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.zone.spinlock().release(self.zone.owner) {
            tracing::error!(zone = %self.zone.name, %err, "failed to release zone lock");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::slab::chunk_size;
    use crate::spinlock::SpinPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use vortex_core::ByteSize;

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    /// Removes the shared object when the test ends, pass or fail.
    pub(crate) struct TestZone(Option<SharedZone>);

    impl TestZone {
        pub(crate) fn new(size: usize) -> Self {
            let name = format!("u{}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed));
            let zone = SharedZone::create(&ZoneConfig::new(name, ByteSize(size as u64)))
                .unwrap()
                .with_policy(SpinPolicy {
                    max_spins: 64,
                    stale_after: Duration::from_millis(2),
                    timeout: Duration::from_millis(500),
                });
            Self(Some(zone))
        }

        pub(crate) fn map(self, f: impl FnOnce(SharedZone) -> SharedZone) -> Self {
            let mut this = self;
            let zone = this.0.take().unwrap();
            this.0 = Some(f(zone));
            this
        }
    }

    impl std::ops::Deref for TestZone {
        type Target = SharedZone;
        fn deref(&self) -> &SharedZone {
            self.0.as_ref().unwrap()
        }
    }

    impl Drop for TestZone {
        fn drop(&mut self) {
            if let Some(zone) = self.0.take() {
                let _ = zone.destroy();
            }
        }
    }

    pub(crate) struct Alive;
    impl OwnerProbe for Alive {
        fn is_alive(&self, _: OwnerId) -> bool {
            true
        }
    }

    pub(crate) struct Dead;
    impl OwnerProbe for Dead {
        fn is_alive(&self, _: OwnerId) -> bool {
            false
        }
    }

    pub(crate) fn owner(raw: u32) -> OwnerId {
        OwnerId::new(raw).unwrap()
    }

    #[test]
    fn header_fits_before_the_heap() {
        assert_eq!(ZONE_HEADER_SIZE % 64, 0);
        assert!(META_OFFSET + mem::size_of::<ZoneMeta>() <= ZONE_HEADER_SIZE);
    }

    #[test]
    fn too_small_zone_is_a_config_error() {
        let err = SharedZone::create(&ZoneConfig::new("upstream_fair_t", ByteSize(150))).unwrap_err();
        assert!(matches!(err, ZoneError::TooSmall { size: 150, .. }));
        assert!(err.is_config_error());
    }

    #[test]
    fn oversized_seed_is_a_config_error() {
        let name = format!("big{}", std::process::id());
        let mut cfg = ZoneConfig::new(name.clone(), ByteSize(64 * 1024));
        cfg.seed = Some("x".repeat(crate::slab::MAX_RECORD_SIZE + 1));

        let err = SharedZone::create(&cfg).unwrap_err();
        assert!(matches!(err, ZoneError::SeedTooLarge { len: 8193, max: 8192, .. }));
        assert!(err.is_config_error());
        // nothing was created, so the name is still free
        SharedZone::create(&ZoneConfig::new(name, ByteSize(4096))).unwrap().destroy().unwrap();
    }

    #[test]
    fn seed_must_fit_the_heap() {
        let heap = 256;
        let size = ByteSize((ZONE_HEADER_SIZE + heap) as u64);
        let mut cfg = ZoneConfig::new(format!("heap{}", std::process::id()), size);
        cfg.seed = Some("y".repeat(heap + 1));
        let err = SharedZone::create(&cfg).unwrap_err();
        assert!(matches!(err, ZoneError::SeedTooLarge { max: 256, .. }), "{err}");

        cfg.seed = Some("y".repeat(heap));
        let zone = SharedZone::create(&cfg).unwrap();
        let mapped = zone.attach().unwrap();
        assert_eq!(mapped.lock().unwrap().seed().unwrap().len(), heap);
        drop(mapped);
        zone.destroy().unwrap();
    }

    #[test]
    fn largest_chunk_rounds_down_to_a_class() {
        assert_eq!(largest_chunk(0), 0);
        assert_eq!(largest_chunk(64), 64);
        assert_eq!(largest_chunk(100), 64);
        assert_eq!(largest_chunk(1 << 20), 8192);
    }

    #[test]
    fn name_collision_is_a_config_error() {
        let zone = TestZone::new(4096);
        let err = SharedZone::create(&ZoneConfig::new(zone.name(), ByteSize(4096))).unwrap_err();
        assert!(matches!(err, ZoneError::NameInUse(_)));
        assert!(err.is_config_error());
    }

    #[test]
    fn registry_rejects_duplicates() {
        let name = format!("r{}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed));
        let config = ZoneConfig::new(name.clone(), ByteSize(4096));

        let mut registry = ZoneRegistry::new();
        registry.create(&config).unwrap();
        assert!(matches!(
            registry.create(&config),
            Err(ZoneError::DuplicateName(n)) if n == name
        ));
        assert!(registry.get(&name).is_some());
        registry.destroy_all().unwrap();
    }

    #[test]
    fn attach_after_destroy_fails() {
        let zone = SharedZone::create(&ZoneConfig::new(
            format!("d{}", std::process::id()),
            ByteSize(4096),
        ))
        .unwrap();
        let mapped = zone.attach().unwrap();
        let name = zone.name().to_string();
        let os_name = zone.os_name.clone();
        zone.destroy().unwrap();

        // existing mapping keeps working
        assert!(mapped.lock().unwrap().verify().is_ok());
        let err = ShmRegion::open(&os_name, 4096).unwrap_err();
        assert!(matches!(err, ZoneError::Sys(Errno::ENOENT)), "{name}: {err}");
    }

    #[test]
    fn first_attach_initializes_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let zone = TestZone::new(4096).map(|z| {
            z.with_initializer(move |guard| {
                counter.fetch_add(1, Ordering::SeqCst);
                guard.find_or_create(PeerKey::new(1, 0), &[1, 1])?;
                Ok(())
            })
        });

        let a = zone.attach_as(owner(1), Box::new(Alive)).unwrap();
        let b = zone.attach_as(owner(2), Box::new(Alive)).unwrap();
        assert!(a.initialized_here());
        assert!(!b.initialized_here());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let guard = b.lock().unwrap();
        assert_eq!(guard.keys().unwrap(), vec![PeerKey::new(1, 0)]);
        assert_eq!(guard.usage().initialized_by, 1);
    }

    #[test]
    fn seed_payload_is_shared() {
        let zone = TestZone::new(4096);
        let mut cfg = ZoneConfig::new(format!("s{}", std::process::id()), ByteSize(4096));
        cfg.seed = Some("i love nginx modules".to_string());
        let seeded = SharedZone::create(&cfg).unwrap();

        let a = seeded.attach().unwrap();
        let b = seeded.attach().unwrap();
        assert_eq!(b.lock().unwrap().seed().unwrap(), b"i love nginx modules");
        drop((a, b));
        seeded.destroy().unwrap();

        let plain = zone.attach().unwrap();
        assert!(plain.lock().unwrap().seed().unwrap().is_empty());
    }

    #[test]
    fn failed_initializer_leaves_zone_uninitialized() {
        let fail = Arc::new(AtomicUsize::new(1));
        let flag = fail.clone();
        let zone = TestZone::new(4096).map(|z| {
            z.with_initializer(move |_| {
                if flag.fetch_sub(1, Ordering::SeqCst) == 1 {
                    Err(ZoneError::Corrupted("injected"))
                } else {
                    Ok(())
                }
            })
        });

        assert!(zone.attach().is_err());
        let retry = zone.attach().unwrap();
        assert!(retry.initialized_here());
    }

    #[test]
    fn exhaustion_then_existing_records_intact() {
        const M: usize = 6;
        let zone = TestZone::new(ZONE_HEADER_SIZE + M * chunk_size(40).unwrap());
        let mapped = zone.attach().unwrap();
        let mut guard = mapped.lock().unwrap();

        let mut records = Vec::new();
        for i in 0..M {
            let at = guard.allocate(40).unwrap();
            guard.bytes_mut(at, 40).unwrap().fill(i as u8 + 1);
            records.push(at);
        }
        assert!(matches!(guard.allocate(40), Err(ZoneError::OutOfSpace { .. })));

        for (i, at) in records.iter().enumerate() {
            assert!(guard.bytes(*at, 40).unwrap().iter().all(|b| *b == i as u8 + 1));
        }
        assert_eq!(guard.usage().live_allocations, M as u32);
        assert!(!guard.is_poisoned());
    }

    #[test]
    fn dead_holder_mid_update_poisons_the_zone() {
        let zone = TestZone::new(4096);
        let survivor = zone.attach_as(owner(2), Box::new(Dead)).unwrap();

        {
            let mut guard = survivor.lock().unwrap();
            guard.find_or_create(PeerKey::new(1, 0), &[1]).unwrap();
            // simulate a holder that died between setting and clearing the flag
            guard.meta().mutating = 1;
            std::mem::forget(guard);
        }
        // hand the word to a "dead" process
        let lock = survivor.spinlock();
        lock.release(owner(2)).unwrap();
        lock.try_acquire(owner(77)).unwrap();

        let mut guard = survivor.lock().unwrap();
        assert!(guard.is_poisoned());
        assert_eq!(guard.usage().lock_recoveries, 1);
        assert!(guard.find(&PeerKey::new(1, 0)).unwrap_err().is_corruption());
        assert!(guard.allocate(16).unwrap_err().is_corruption());
    }

    #[test]
    fn stale_lock_during_init_is_recovered() {
        let zone = TestZone::new(4096);
        let first = zone.attach_as(owner(5), Box::new(Dead)).unwrap();
        // a process died before the header marker was written
        first.lock().map(|mut g| g.meta().magic = 0).unwrap();
        first.spinlock().try_acquire(owner(99)).unwrap();

        let second = zone.attach_as(owner(6), Box::new(Dead)).unwrap();
        assert!(second.initialized_here());
        let guard = second.lock().unwrap();
        assert!(!guard.is_poisoned());
        assert_eq!(guard.usage().lock_recoveries, 1);
    }
}
