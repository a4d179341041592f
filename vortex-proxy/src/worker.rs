//! Worker process: routes requests to backends, recording every one in the zone.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context};
use vortex_core::{PeerSet, RoutingTable};
use vortex_shm::{Zone, ZoneError, ZoneRegistry};

use crate::health_check::prober;

/// Knobs shared by all workers.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Requests to route before exiting
    pub requests: u64,
    /// Backend connect timeout
    pub connect_timeout: Duration,
}

/// What one worker did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Requests a backend answered
    pub served: u64,
    /// Requests whose backend did not answer
    pub failed: u64,
    /// Requests turned away because the backend was at its limit
    pub rejected: u64,
}

/// Attach to every zone and route `options.requests` requests round-robin across the
/// peer sets and their backends.
pub fn run(
    index: usize,
    registry: &ZoneRegistry,
    routing: &RoutingTable,
    options: &WorkerOptions,
) -> anyhow::Result<WorkerSummary> {
    let mut zones = HashMap::new();
    for shared in registry.iter() {
        let zone = shared
            .attach()
            .with_context(|| format!("failed to attach zone {}", shared.name()))?;
        if zone.initialized_here() {
            tracing::info!(worker = index, zone = zone.name(), "initialized zone");
        }
        zones.insert(shared.name().to_string(), zone);
    }

    let sets = routing.snapshot();
    if sets.is_empty() {
        bail!("no upstreams configured");
    }

    let mut summary = WorkerSummary::default();
    for n in 0..options.requests {
        let (set, peer) = rotate(n, index, sets.len(), |s| sets[s].len());
        let set = &sets[set];
        let zone = zones
            .get(&set.zone)
            .with_context(|| format!("upstream {} uses unknown zone {}", set.name, set.zone))?;

        match route(zone, set, peer, options.connect_timeout) {
            Ok(true) => summary.served += 1,
            Ok(false) => summary.failed += 1,
            Err(ZoneError::Saturated { .. }) => summary.rejected += 1,
            Err(err) => return Err(err).with_context(|| format!("request to {} failed", set.name)),
        }
    }
    Ok(summary)
}

/// Send one request to peer `peer` of `set`. Returns whether it answered.
fn route(zone: &Zone, set: &PeerSet, peer: usize, timeout: Duration) -> Result<bool, ZoneError> {
    let mut request = zone.begin_request(set, peer)?;
    let backend = &set.backends[peer];
    let answered = prober::check(backend, timeout);
    if !answered {
        request.fail();
    }
    let after = request.finish()?;
    tracing::debug!(
        upstream = %set.name,
        backend = %backend.addr,
        request = after.last_request_id,
        answered,
        "routed request"
    );
    Ok(answered)
}

/// Request `n` of worker `worker` goes to this (set, peer) pair.
fn rotate(n: u64, worker: usize, sets: usize, peers: impl Fn(usize) -> usize) -> (usize, usize) {
    let turn = n as usize + worker;
    let set = turn % sets;
    (set, (turn / sets) % peers(set).max(1))
}
