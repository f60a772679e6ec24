//! Core configuration types and loading.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use super::defaults;
use super::limits::LimitsConfig;
use super::services::{BackendBlock, DiscoveryConfig, GatewayConfig, RouterConfig, ServiceBlock};
use super::validation::{self, ValidationError};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Node identity.
    pub server: ServerConfig,
    /// Listener addresses.
    pub listen: ListenConfig,
    /// Connection and frame limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Service router.
    #[serde(default)]
    pub router: RouterConfig,
    /// Coordination store.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Client-facing behaviour.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// External services registered at startup.
    #[serde(default)]
    pub services: Vec<ServiceBlock>,
    /// Built-in services hosted by this node.
    #[serde(default)]
    pub backends: Vec<BackendBlock>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate, returning every error found.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        validation::validate(self)
    }
}

/// Node identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Node name, used in logs.
    pub name: String,
    /// Instance id announced for hosted backends.
    #[serde(default = "defaults::default_node_id")]
    pub node_id: String,
    /// Port for the Prometheus `/metrics` endpoint; 0 disables it.
    #[serde(default)]
    pub metrics_port: u16,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Client gateway address (e.g., "0.0.0.0:7000").
    pub address: SocketAddr,
    /// Route RPC address. Unset: the router is not reachable from other nodes.
    #[serde(default)]
    pub rpc: Option<SocketAddr>,
}
