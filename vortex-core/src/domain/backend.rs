//! Backend server models.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A unique identifier for a backend server within its peer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(pub u32);

/// Represents a single upstream backend server
#[derive(Debug)]
pub struct Backend {
    /// The unique ID of the backend
    pub id: BackendId,
    /// The socket address of the backend
    pub addr: SocketAddr,
    /// Configured weight, used to seed the shared statistics record
    pub weight: u32,
    /// Upper bound on concurrent requests, `None` for unlimited
    pub max_in_flight: Option<NonZeroU32>,
    /// Whether the backend is currently considered healthy
    healthy: AtomicBool,
}

impl Backend {
    /// Create a new backend with weight 1 and no concurrency limit
    pub fn new(id: BackendId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            weight: 1,
            max_in_flight: None,
            healthy: AtomicBool::new(true), // assume healthy initially
        }
    }

    /// Set the configured weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the concurrency limit
    pub fn with_max_in_flight(mut self, limit: Option<NonZeroU32>) -> Self {
        self.max_in_flight = limit;
        self
    }

    /// Check if the backend is marked healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Update the health status of the backend
    pub fn set_healthy(&self, is_healthy: bool) {
        self.healthy.store(is_healthy, Ordering::Release);
    }
}

/// A thread-safe reference to a Backend.
pub type SharedBackend = Arc<Backend>;
