//! taskpilot daemon — runs the orchestration stack and serves the
//! per-task event stream.

use anyhow::{Context, Result};
use tracing::info;

use tp_core::config::Config;

mod daemon;

use daemon::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tp_telemetry::logging::init_logging("tp-daemon", "info");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(path).context("failed to load config file")?,
        None => Config::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            Config::default()
        }),
    };

    info!(version = env!("CARGO_PKG_VERSION"), "taskpilot daemon starting");

    let daemon = Daemon::new(config).await?;
    daemon.run().await
}
