//! Cross-process shared statistics zone.
//!
//! Worker processes forked from one supervisor all handle requests for the same
//! upstream peers. This crate gives them one named shared memory zone to keep live
//! per-peer statistics in:
//!
//! - [`SharedZone`] creates the zone at configuration time and maps it into each worker.
//! - [`SpinLock`] serializes every access across processes and recovers from holders
//!   that died inside a critical section.
//! - A slab allocator and an AVL index keyed by [`PeerKey`](vortex_core::PeerKey) live
//!   inside the zone and link records by [`ZoneOffset`], never by address.
//! - [`PeerStats`] records are read and written through a [`ZoneGuard`] or the
//!   [`Zone::begin_request`] in-flight guard.
//!
//! ```no_run
//! use vortex_core::{ByteSize, ZoneConfig};
//! use vortex_shm::SharedZone;
//!
//! # fn main() -> Result<(), vortex_shm::ZoneError> {
//! let shared = SharedZone::create(&ZoneConfig::new("stats", ByteSize(64 * 1024)))?;
//! let zone = shared.attach()?;
//! let keys = zone.lock()?.keys()?;
//! assert!(keys.is_empty());
//! drop(zone);
//! shared.destroy()?;
//! # Ok(())
//! # }
//! ```

mod error;
mod index;
mod offset;
mod region;
mod slab;
mod spinlock;
mod stats;
mod zone;

pub use error::ZoneError;
pub use index::{IndexShape, NODE_SIZE};
pub use offset::ZoneOffset;
pub use slab::{chunk_size, MAX_RECORD_SIZE, SIZE_CLASSES};
pub use spinlock::{Acquired, OwnerId, OwnerProbe, ProcessProbe, SpinLock, SpinPolicy};
pub use stats::{block_size, InFlight, PeerStats, StatsHandle};
pub use zone::{
    Initializer, SharedZone, Zone, ZoneGuard, ZoneRegistry, ZoneState, ZoneUsage, MIN_ZONE_SIZE,
    ZONE_HEADER_SIZE,
};
