//! Logging setup for Moult Server.
//!
//! Every generation writes to the stderr it inherited from its predecessor,
//! so the pid is part of each startup line to tell generations apart.
//!
//! # Configuration
//!
//! - `RUST_LOG`: Log filter (default: `info,moult_server=debug,moult_ecdysis=debug`)
//! - `MOULT_LOG_FORMAT` / `--log-format`: `pretty` or `json`

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "info,moult_server=debug,moult_ecdysis=debug";

/// Install the global tracing subscriber.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(fmt_layer.pretty()).try_init()?,
        LogFormat::Json => registry.with(fmt_layer.json()).try_init()?,
    }

    tracing::info!(format = %format, pid = std::process::id(), "Telemetry initialized");

    Ok(())
}
