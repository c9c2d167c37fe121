use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use sacn_net::SocketOptions;
use sacn_protocol::{DEFAULT_PRIORITY, DISCOVERY_INTERVAL_SECS, SOURCE_EXPIRY_SECS, SWEEP_INTERVAL_SECS};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_ttl")]
    pub multicast_ttl: u32,
    #[serde(default = "default_true")]
    pub multicast_loop: bool,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    /// Transmitter advertisement period
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,
    /// Silence after which a source is dropped
    #[serde(default = "default_expiry")]
    pub expiry_secs: u64,
    #[serde(default = "default_sweep")]
    pub sweep_secs: u64,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            priority: default_priority(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            multicast_ttl: default_ttl(),
            multicast_loop: true,
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            interval_secs: default_discovery_interval(),
            expiry_secs: default_expiry(),
            sweep_secs: default_sweep(),
        }
    }
}

fn default_name() -> String { "sacn-rs".to_string() }
fn default_priority() -> u8 { DEFAULT_PRIORITY }
fn default_interface() -> Ipv4Addr { Ipv4Addr::UNSPECIFIED }
fn default_ttl() -> u32 { 1 }
fn default_true() -> bool { true }
fn default_read_timeout() -> u64 { 1000 }
fn default_discovery_interval() -> u64 { DISCOVERY_INTERVAL_SECS }
fn default_expiry() -> u64 { SOURCE_EXPIRY_SECS }
fn default_sweep() -> u64 { SWEEP_INTERVAL_SECS }

impl Config {
    /// Read `path`, falling back to defaults when it does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let config_str = tokio::fs::read_to_string(path).await.map_err(|e| {
            error!("Failed to read config file {:?}: {}", path, e);
            e
        })?;

        let config: Config = toml::from_str(&config_str).map_err(|e| {
            error!("Failed to parse config: {}", e);
            e
        })?;

        Ok(config)
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            interface: self.network.interface,
            multicast_ttl: self.network.multicast_ttl,
            multicast_loop: self.network.multicast_loop,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.network.read_timeout_ms.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.interval_secs.max(1))
    }

    pub fn source_expiry(&self) -> Duration {
        Duration::from_secs(self.discovery.expiry_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.sweep_secs.max(1))
    }
}
