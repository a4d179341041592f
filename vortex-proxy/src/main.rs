//! Vortex Proxy Engine
//!
//! A supervisor process that creates the shared statistics zones, forks worker
//! processes that route requests to upstream backends, and reports what the workers
//! recorded in the zones once they are done.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod health_check;
mod server;
mod worker;

/// Command line options.
#[derive(Debug, Parser)]
#[command(name = "vortex-proxy", version, about)]
pub struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "vortex.toml")]
    pub config: PathBuf,
    /// Worker processes to fork
    #[arg(short, long, default_value_t = 4)]
    pub workers: usize,
    /// Requests each worker routes before exiting
    #[arg(short, long, default_value_t = 100)]
    pub requests: u64,
    /// Backend connect timeout in milliseconds
    #[arg(long, default_value_t = 200)]
    pub connect_timeout_ms: u64,
    /// Leave the zones in place at exit, for inspection
    #[arg(long)]
    pub keep_zone: bool,
}

impl Args {
    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

/// The primary entrypoint for the Vortex supervisor.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    tracing::info!(config = %args.config.display(), workers = args.workers, "starting Vortex supervisor");

    server::run(&args)?;

    tracing::info!("shutting down gracefully");
    Ok(())
}
