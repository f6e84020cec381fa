//! Daemon configuration
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! an optional TOML file given with `--config`, and command line flags (or
//! their environment variables).
//!
//! ```toml
//! bird_socket = "/run/bird/bird.ctl"
//! metrics_listen_address = "127.0.0.1:9302"
//! interval = "10s"
//! enable_counter = true
//! table = "filter"
//! chain = "flowspec"
//! ```

use crate::bird::DEFAULT_BIRD_SOCKET;
use crate::error::{FlowspecError, Result};
use crate::expr::{ChainId, TableFamily};
use crate::metrics_server::DEFAULT_METRICS_ADDRESS;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_TABLE: &str = "filter";
pub const DEFAULT_CHAIN: &str = "flowspec";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Command line arguments
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "flowspecd", version, about = "BIRD flowspec to nftables daemon")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Path to the BIRD control socket [default: /run/bird/bird.ctl]
    #[arg(long, env = "BIRD_SOCKET_PATH")]
    pub bird_socket: Option<PathBuf>,

    /// Address to serve metrics on [default: 127.0.0.1:9302]
    #[arg(long = "metrics.listen-address")]
    pub metrics_listen_address: Option<SocketAddr>,

    /// Interval between route checks, e.g. "10s" or "1m" [default: 10s]
    #[arg(long, env = "CHECK_INTERVAL", value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Count matched and dropped traffic in named nftables counters
    #[arg(long, env = "ENABLE_COUNTER")]
    pub enable_counter: bool,

    /// nftables table (inet family) holding the flowspec chain [default: filter]
    #[arg(long)]
    pub table: Option<String>,

    /// nftables chain owned by the daemon [default: flowspec]
    #[arg(long)]
    pub chain: Option<String>,

    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Resolve the effective configuration.
    pub fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };

        config.debug |= self.debug;
        config.enable_counter |= self.enable_counter;
        if let Some(path) = self.bird_socket {
            config.bird_socket = path;
        }
        if let Some(addr) = self.metrics_listen_address {
            config.metrics_listen_address = addr;
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(table) = self.table {
            config.table = table;
        }
        if let Some(chain) = self.chain {
            config.chain = chain;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Effective daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_bird_socket")]
    pub bird_socket: PathBuf,

    #[serde(default = "default_metrics_listen_address")]
    pub metrics_listen_address: SocketAddr,

    /// Check interval; also bounds each route query
    #[serde(default = "default_interval", with = "duration")]
    pub interval: Duration,

    #[serde(default)]
    pub enable_counter: bool,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_chain")]
    pub chain: String,
}

fn default_bird_socket() -> PathBuf {
    PathBuf::from(DEFAULT_BIRD_SOCKET)
}

fn default_metrics_listen_address() -> SocketAddr {
    DEFAULT_METRICS_ADDRESS
        .parse()
        .unwrap_or(SocketAddr::from((Ipv4Addr::LOCALHOST, 9302)))
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_chain() -> String {
    DEFAULT_CHAIN.to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            debug: false,
            bird_socket: default_bird_socket(),
            metrics_listen_address: default_metrics_listen_address(),
            interval: default_interval(),
            enable_counter: false,
            table: default_table(),
            chain: default_chain(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content).map_err(|e| {
            FlowspecError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(FlowspecError::Config(
                "interval must be greater than zero".to_string(),
            ));
        }

        if self.table.trim().is_empty() {
            return Err(FlowspecError::Config("table name must not be empty".to_string()));
        }

        if self.chain.trim().is_empty() {
            return Err(FlowspecError::Config("chain name must not be empty".to_string()));
        }

        Ok(())
    }

    /// The chain the daemon owns.
    pub fn chain_id(&self) -> ChainId {
        ChainId::new(TableFamily::Inet, self.table.clone(), self.chain.clone())
    }
}

/// Serde adapter for humantime durations ("10s", "1m 30s").
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
