//! Moult Server - an HTTP echo service that restarts without closing its
//! listening socket.
//!
//! `SIGHUP` spawns the next generation with the listener at fd 3; the new
//! process sends `SIGTSTP` back, and this one closes its listener and exits.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use moult_ecdysis::{Invocation, Lifecycle, SignalSource};
use tracing::info;

mod config;
mod http;
mod telemetry;

use config::{LogFormat, Overrides, ServerConfig};
use http::{create_router, HttpService};

/// Moult Server - zero-downtime restarting HTTP echo service
///
/// The restart marker (`-continue`) is added by the running server when it
/// spawns its successor and is not part of this interface.
#[derive(Parser, Debug)]
#[command(name = "moult-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address (overrides MOULT_LISTEN_ADDR)
    #[arg(short, long)]
    addr: Option<SocketAddr>,

    /// Request header read timeout in seconds (overrides MOULT_READ_TIMEOUT_SECS)
    #[arg(long)]
    read_timeout_secs: Option<u64>,

    /// Log output format (overrides MOULT_LOG_FORMAT)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl From<Cli> for Overrides {
    fn from(cli: Cli) -> Self {
        Self {
            listen_addr: cli.addr,
            read_timeout_secs: cli.read_timeout_secs,
            log_format: cli.log_format,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let invocation = Invocation::from_env();
    let cli = Cli::parse_from(invocation.argv_without_marker());

    let server_config = ServerConfig::from_env()
        .context("Failed to load server configuration")?
        .with_overrides(cli.into());

    telemetry::init(server_config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("Moult Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(pid = std::process::id(), role = %invocation.role(), "Process role determined");
    server_config.log_config();

    // Handlers go in before the listener exists: by the time anyone can reach
    // this process, SIGHUP and SIGTSTP no longer have their default effect.
    let signals = SignalSource::install().context("Failed to install signal handlers")?;

    let lifecycle = Lifecycle::start(server_config.listen_addr, invocation)
        .await
        .context("Failed to acquire listener")?;

    let service = HttpService::new(create_router(), server_config.read_timeout);
    lifecycle.serve(&service, signals).await.exit()
}
