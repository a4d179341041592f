//! Supervisor: zone setup, worker processes and the final report.

use std::collections::HashMap;

use anyhow::{bail, Context};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use vortex_core::{Config, PeerKey, RoutingTable, SharedPeerSet};
use vortex_shm::{PeerStats, ZoneRegistry};

use crate::worker::{self, WorkerOptions};
use crate::Args;

/// Create the zones, run the workers to completion and report.
pub fn run(args: &Args) -> anyhow::Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let options = WorkerOptions {
        requests: args.requests,
        connect_timeout: args.connect_timeout(),
    };
    serve(&config, args.workers, &options, args.keep_zone)
}

fn serve(config: &Config, workers: usize, options: &WorkerOptions, keep_zone: bool) -> anyhow::Result<()> {
    let routing = RoutingTable::new(&config.upstreams);

    let mut registry = ZoneRegistry::from_config(&config.zones).context("failed to create shared zones")?;
    register_initializers(&mut registry, &routing);
    if let Err(err) = prepare(&registry) {
        if let Err(cleanup) = registry.destroy_all() {
            tracing::warn!(%cleanup, "failed to remove zones after a startup error");
        }
        return Err(err);
    }

    let outcome = supervise(&registry, &routing, workers, options);

    if let Err(err) = report(&registry, &routing) {
        tracing::warn!(%err, "could not read back zone statistics");
    }

    if keep_zone {
        for zone in registry.iter() {
            tracing::info!(zone = zone.name(), "keeping zone for inspection");
        }
    } else {
        registry.destroy_all().context("failed to destroy shared zones")?;
    }
    outcome
}

/// Pre-create the statistics block of every peer set when its zone is initialized.
fn register_initializers(registry: &mut ZoneRegistry, routing: &RoutingTable) {
    let mut per_zone: HashMap<String, Vec<(PeerKey, Vec<u32>)>> = HashMap::new();
    for set in routing.snapshot().iter() {
        per_zone
            .entry(set.zone.clone())
            .or_default()
            .push((set.key, set.weights()));
    }

    for (name, sets) in per_zone {
        let Some(zone) = registry.get_mut(&name) else {
            continue;
        };
        zone.set_initializer(move |guard| {
            for (key, weights) in &sets {
                guard.find_or_create(*key, weights)?;
            }
            tracing::debug!(sets = sets.len(), "pre-created peer statistics");
            Ok(())
        });
    }
}

/// Initialize every zone in the supervisor, so a zone that cannot hold its peer sets
/// stops startup before any worker exists.
fn prepare(registry: &ZoneRegistry) -> anyhow::Result<()> {
    for shared in registry.iter() {
        let zone = shared
            .attach()
            .with_context(|| format!("failed to initialize zone {}", shared.name()))?;
        let usage = zone.lock()?.usage();
        tracing::info!(
            zone = zone.name(),
            initialized = zone.initialized_here(),
            carved = usage.carved,
            peer_sets = usage.peer_sets,
            "zone ready"
        );
    }
    Ok(())
}

fn supervise(
    registry: &ZoneRegistry,
    routing: &RoutingTable,
    workers: usize,
    options: &WorkerOptions,
) -> anyhow::Result<()> {
    let mut children = HashMap::with_capacity(workers);
    let mut fork_error = None;
    for index in 0..workers {
        // SAFETY: the supervisor is single threaded, and the child only runs the
        // worker loop before `_exit`.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = match worker::run(index, registry, routing, options) {
                    Ok(summary) => {
                        tracing::info!(worker = index, ?summary, "worker finished");
                        0
                    }
                    Err(err) => {
                        tracing::error!(worker = index, "worker failed: {err:#}");
                        1
                    }
                };
                // SAFETY: ends the child without running the supervisor's exit handlers.
                unsafe { nix::libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                tracing::debug!(worker = index, pid = child.as_raw(), "forked worker");
                children.insert(child, index);
            }
            Err(err) => {
                fork_error = Some(err);
                break;
            }
        }
    }

    let started = children.len();
    let failed = reap_all(children)?;
    if let Some(err) = fork_error {
        return Err(err).with_context(|| format!("failed to fork worker {started}"));
    }
    if failed > 0 {
        bail!("{failed} of {workers} workers failed");
    }
    Ok(())
}

/// Wait for every worker in the order they exit, so a dead one never lingers as a
/// zombie holding the zone lock. Returns how many failed.
fn reap_all(mut children: HashMap<Pid, usize>) -> anyhow::Result<usize> {
    let mut failed = 0;
    while !children.is_empty() {
        let status = match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("failed to wait for workers"),
        };
        let Some(pid) = status.pid() else {
            continue;
        };
        let Some(index) = children.remove(&pid) else {
            tracing::debug!(pid = pid.as_raw(), "reaped a process that is not a worker");
            continue;
        };
        if !succeeded(index, status) {
            failed += 1;
        }
    }
    Ok(failed)
}

fn succeeded(index: usize, status: WaitStatus) -> bool {
    match status {
        WaitStatus::Exited(_, 0) => true,
        WaitStatus::Exited(pid, code) => {
            tracing::warn!(worker = index, pid = pid.as_raw(), code, "worker exited with an error");
            false
        }
        WaitStatus::Signaled(pid, signal, _) => {
            tracing::warn!(worker = index, pid = pid.as_raw(), ?signal, "worker was killed");
            false
        }
        other => {
            tracing::warn!(worker = index, status = ?other, "unexpected worker status");
            false
        }
    }
}

fn report(registry: &ZoneRegistry, routing: &RoutingTable) -> anyhow::Result<()> {
    let sets = routing.snapshot();
    for shared in registry.iter() {
        let zone = shared.attach()?;
        let guard = zone.lock()?;
        let usage = guard.usage();
        tracing::info!(
            zone = zone.name(),
            size = usage.size,
            carved = usage.carved,
            peer_sets = usage.peer_sets,
            lock_recoveries = usage.lock_recoveries,
            initialized_by = usage.initialized_by,
            "zone usage"
        );
        drop(guard);

        for set in sets.iter().filter(|s| s.zone == zone.name()) {
            report_set(set, &zone.peer_stats(set)?);
        }
    }
    Ok(())
}

fn report_set(set: &SharedPeerSet, stats: &[PeerStats]) {
    for (backend, stats) in set.backends.iter().zip(stats) {
        tracing::info!(
            upstream = %set.name,
            backend = %backend.addr,
            total = stats.total_requests,
            fails = stats.fails,
            in_flight = stats.in_flight,
            weight = stats.weight,
            "peer statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use vortex_core::ZoneConfig;
    use vortex_shm::SharedZone;

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    fn zone_name() -> String {
        format!("srv{}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed))
    }

    // nothing listens on these ports, so every request fails fast
    fn config(zone: &str, size: &str) -> Config {
        Config::from_toml(&format!(
            r#"
            [[zone]]
            name = "{zone}"
            size = "{size}"

            [[upstream]]
            name = "app"
            zone = "{zone}"

            [[upstream.backend]]
            addr = "127.0.0.1:1"
            weight = 3

            [[upstream.backend]]
            addr = "127.0.0.1:2"

            [[upstream]]
            name = "static"
            zone = "{zone}"

            [[upstream.backend]]
            addr = "127.0.0.1:3"
            "#
        ))
        .unwrap()
    }

    fn options(requests: u64) -> WorkerOptions {
        WorkerOptions {
            requests,
            connect_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn supervisor_initializes_zones_before_forking() {
        let name = zone_name();
        let config = config(&name, "32k");
        let routing = RoutingTable::new(&config.upstreams);
        let mut registry = ZoneRegistry::from_config(&config.zones).unwrap();
        register_initializers(&mut registry, &routing);

        prepare(&registry).unwrap();

        let zone = registry.get(&name).unwrap().attach().unwrap();
        assert!(!zone.initialized_here());
        let guard = zone.lock().unwrap();
        let keys: Vec<_> = routing.snapshot().iter().map(|s| s.key).collect();
        assert_eq!(guard.keys().unwrap(), keys);
        assert_eq!(guard.usage().initialized_by, std::process::id());
        drop(guard);
        registry.destroy_all().unwrap();
    }

    #[test]
    fn zone_too_small_for_its_peer_sets_stops_startup() {
        let name = zone_name();
        let min = vortex_shm::MIN_ZONE_SIZE.to_string();
        let err = serve(&config(&name, &min), 2, &options(1), false).unwrap_err();
        assert!(format!("{err:#}").contains(&name), "{err:#}");

        // the zone was removed again
        let again = SharedZone::create(&ZoneConfig::new(name, vortex_core::ByteSize(4096))).unwrap();
        again.destroy().unwrap();
    }

    // the only test here that forks: reaping collects any child of this process
    #[test]
    fn workers_are_forked_reaped_and_reported() {
        const WORKERS: usize = 3;
        const REQUESTS: u64 = 4;

        let name = zone_name();
        let config = config(&name, "32k");
        let routing = RoutingTable::new(&config.upstreams);
        let mut registry = ZoneRegistry::from_config(&config.zones).unwrap();
        register_initializers(&mut registry, &routing);
        prepare(&registry).unwrap();

        supervise(&registry, &routing, WORKERS, &options(REQUESTS)).unwrap();
        report(&registry, &routing).unwrap();

        let zone = registry.get(&name).unwrap().attach().unwrap();
        let mut total = 0;
        for set in routing.snapshot().iter() {
            for stats in zone.peer_stats(set).unwrap() {
                assert_eq!(stats.in_flight, 0);
                assert!(stats.fails <= stats.total_requests);
                total += stats.total_requests;
            }
        }
        assert_eq!(total, WORKERS as u64 * REQUESTS);
        assert_eq!(zone.lock().unwrap().usage().lock_recoveries, 0);
        drop(zone);
        registry.destroy_all().unwrap();
    }

    #[test]
    fn no_workers_is_a_clean_run() {
        let name = zone_name();
        let config = config(&name, "32k");
        let routing = RoutingTable::new(&config.upstreams);
        let registry = ZoneRegistry::from_config(&config.zones).unwrap();
        assert_eq!(reap_all(HashMap::new()).unwrap(), 0);
        supervise(&registry, &routing, 0, &options(1)).unwrap();
        registry.destroy_all().unwrap();
    }
}
