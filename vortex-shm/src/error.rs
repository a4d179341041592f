//! Errors raised by the shared zone.

use std::io;

use vortex_core::{ConfigError, PeerKey};

use crate::spinlock::OwnerId;

/// Everything that can go wrong while creating, attaching or using a zone.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    /// The zone declaration itself is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Another zone, or a leftover from a previous run, already uses the OS name
    #[error("zone \"{0}\" already exists")]
    NameInUse(String),
    /// Two zones with one name were registered
    #[error("zone \"{0}\" is registered more than once")]
    DuplicateName(String),
    /// Attaching to a zone whose region was never created or already destroyed
    #[error("zone \"{0}\" does not exist")]
    NotCreated(String),
    /// The zone cannot even hold its own header
    #[error("zone \"{name}\" needs at least {min} bytes, got {size}")]
    TooSmall {
        /// Zone name
        name: String,
        /// Configured size
        size: usize,
        /// Smallest usable size
        min: usize,
    },
    /// The seed payload cannot fit in one chunk of the zone's heap
    #[error("seed of zone \"{name}\" is {len} bytes, at most {max} fit")]
    SeedTooLarge {
        /// Zone name
        name: String,
        /// Seed length in bytes
        len: usize,
        /// Largest seed the zone can hold
        max: usize,
    },
    /// The allocator has no chunk left for this request
    #[error("zone exhausted, no room for a {requested} byte record")]
    OutOfSpace {
        /// Requested size in bytes
        requested: usize,
    },
    /// The request exceeds the largest slab class
    #[error("record of {0} bytes exceeds the largest slab class")]
    RecordTooLarge(usize),
    /// The lock stayed with a live owner past the acquire timeout
    #[error("timed out waiting for the zone lock held by {0}")]
    LockTimeout(OwnerId),
    /// Release attempted by a process that does not hold the lock
    #[error("zone lock is held by {holder:?}, not {owner}")]
    NotOwner {
        /// The releasing owner
        owner: OwnerId,
        /// The current holder, if any
        holder: Option<OwnerId>,
    },
    /// A statistics handle whose block was evicted and reused
    #[error("statistics handle for {0} is stale")]
    StaleHandle(PeerKey),
    /// Peer index outside the statistics block
    #[error("peer {index} out of range for a set of {peers}")]
    NoSuchPeer {
        /// Requested index
        index: usize,
        /// Peers in the block
        peers: usize,
    },
    /// The peer reached its concurrency limit
    #[error("peer {peer} of {key} is at its in-flight limit of {limit}")]
    Saturated {
        /// Owning set
        key: PeerKey,
        /// Peer index
        peer: usize,
        /// Configured limit
        limit: u32,
    },
    /// A statistics update that would break a counter's rules
    #[error("rejected statistics update: {0}")]
    InvalidUpdate(&'static str),
    /// The shared structures are inconsistent; never repaired in place
    #[error("zone corrupted: {0}")]
    Corrupted(&'static str),
    /// A system call on the shared memory object failed
    #[error("shared memory call failed: {0}")]
    Sys(#[from] nix::Error),
    /// Other I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ZoneError {
    /// Errors that must stop the server from starting rather than fail a request.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ZoneError::Config(_)
                | ZoneError::NameInUse(_)
                | ZoneError::DuplicateName(_)
                | ZoneError::TooSmall { .. }
                | ZoneError::SeedTooLarge { .. }
        )
    }

    /// Errors caused by an inconsistent shared structure.
    pub fn is_corruption(&self) -> bool {
        matches!(self, ZoneError::Corrupted(_))
    }
}
