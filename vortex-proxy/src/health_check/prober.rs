//! TCP connect probe standing in for forwarding a request.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use vortex_core::Backend;

/// Open (and immediately close) a TCP connection to `addr`.
pub fn probe(addr: SocketAddr, timeout: Duration) -> io::Result<()> {
    TcpStream::connect_timeout(&addr, timeout).map(drop)
}

/// Probe `backend` and update its health flag, logging state changes.
///
/// Returns whether the backend answered.
pub fn check(backend: &Backend, timeout: Duration) -> bool {
    let result = probe(backend.addr, timeout);
    let is_healthy = result.is_ok();
    let was_healthy = backend.is_healthy();

    if is_healthy != was_healthy {
        match &result {
            Ok(()) => tracing::info!(backend = backend.id.0, addr = %backend.addr, "backend is reachable again"),
            Err(err) => tracing::warn!(backend = backend.id.0, addr = %backend.addr, %err, "backend became unreachable"),
        }
        backend.set_healthy(is_healthy);
    }
    is_healthy
}
