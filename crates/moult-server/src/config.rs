//! Server configuration from environment variables, overridable from the
//! command line.
//!
//! # Environment Variables
//!
//! - `MOULT_LISTEN_ADDR`: Listen address. Default: `0.0.0.0:8888`
//! - `MOULT_READ_TIMEOUT_SECS`: Request header read timeout. Default: `6`
//! - `MOULT_LOG_FORMAT`: `pretty` or `json`. Default: `pretty`
//!
//! A successor inherits both the environment and the arguments of its
//! predecessor, so every generation resolves the same listen address.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing::info;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8888";
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 6;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, multi-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl LogFormat {
    /// Parse a log format. Anything other than `json` is pretty.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Command-line overrides. `None` keeps the environment value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen_addr: Option<SocketAddr>,
    pub read_timeout_secs: Option<u64>,
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub read_timeout: Duration,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.parse().expect("Valid default address"),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            log_format: LogFormat::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("MOULT_LISTEN_ADDR") {
            config.listen_addr = raw
                .parse()
                .with_context(|| format!("MOULT_LISTEN_ADDR={raw:?} is not a socket address"))?;
        }

        if let Some(raw) = lookup("MOULT_READ_TIMEOUT_SECS") {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("MOULT_READ_TIMEOUT_SECS={raw:?} is not a number of seconds"))?;
            config.read_timeout = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup("MOULT_LOG_FORMAT") {
            config.log_format = LogFormat::parse_lenient(&raw);
        }

        Ok(config)
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(addr) = overrides.listen_addr {
            self.listen_addr = addr;
        }
        if let Some(secs) = overrides.read_timeout_secs {
            self.read_timeout = Duration::from_secs(secs);
        }
        if let Some(format) = overrides.log_format {
            self.log_format = format;
        }
        self
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Listen address: {}", self.listen_addr);
        info!("Header read timeout: {:?}", self.read_timeout);
        info!("Log format: {}", self.log_format);
    }
}
