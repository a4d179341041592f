//! Domain models for upstream peers and their routing.

pub mod backend;
pub mod peer;
pub mod routing;
