//! Vortex Core functionality.
//!
//! This crate contains the domain models, configuration definitions, and peer identities
//! shared by every Vortex worker process. Nothing here touches shared memory; the
//! `vortex-shm` crate builds the cross-process statistics zone on top of these types.

pub mod config;
pub mod domain;

pub use config::{ByteSize, Config, ConfigError, UpstreamConfig, ZoneConfig};
pub use domain::backend::{Backend, BackendId, SharedBackend};
pub use domain::peer::{PeerKey, PeerSet, SharedPeerSet};
pub use domain::routing::{RoutingTable, SharedRoutingTable};
