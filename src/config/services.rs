//! Router, discovery, and service block configuration.

use imgate_proto::{DiscoveryType, RegisterRequest, RoutePolicy};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use super::defaults;

/// Where this node's router lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterMode {
    /// In-process router following discovery.
    #[default]
    Local,
    /// A route node reached over RPC at `router.remote_address`.
    Remote,
}

/// Service router configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub mode: RouterMode,
    /// Route node address for `mode = "remote"`.
    #[serde(default)]
    pub remote_address: Option<String>,
    /// Deadline per routed call (default: 3000).
    #[serde(default = "defaults::default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Deadline for opening an RPC connection (default: 1000).
    #[serde(default = "defaults::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Instance ping interval; 0 disables health checks (default: 10).
    #[serde(default = "defaults::default_health_interval_secs")]
    pub health_interval_secs: u64,
}

impl RouterConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_secs > 0).then(|| Duration::from_secs(self.health_interval_secs))
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: RouterMode::default(),
            remote_address: None,
            call_timeout_ms: defaults::default_call_timeout_ms(),
            connect_timeout_ms: defaults::default_connect_timeout_ms(),
            health_interval_secs: defaults::default_health_interval_secs(),
        }
    }
}

/// Coordination store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    /// In-process store.
    #[default]
    Memory,
}

/// Discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub kind: DiscoveryKind,
    /// Coordinator endpoints, recorded in registrations.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Lease TTL for announced instances (default: 10).
    #[serde(default = "defaults::default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// How often expired leases are reaped (default: 500).
    #[serde(default = "defaults::default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
}

impl DiscoveryConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(10))
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            kind: DiscoveryKind::default(),
            endpoints: Vec::new(),
            lease_ttl_secs: defaults::default_lease_ttl_secs(),
            reaper_interval_ms: defaults::default_reaper_interval_ms(),
        }
    }
}

/// Client-facing behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Action `session.signin` is forwarded to (default: "api.auth.signin").
    #[serde(default = "defaults::default_auth_action")]
    pub auth_action: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_action: defaults::default_auth_action(),
        }
    }
}

/// An external service registered with the router at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceBlock {
    pub name: String,
    /// Defaults to `name`.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub policy: RoutePolicy,
    #[serde(default)]
    pub discovery: DiscoveryType,
    /// Instance addresses for static discovery.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Extra namespaces.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl ServiceBlock {
    pub fn to_request(&self) -> RegisterRequest {
        RegisterRequest {
            srv_id: self.id.clone().unwrap_or_else(|| self.name.clone()),
            srv_name: self.name.clone(),
            route_policy: self.policy,
            discovery_srv_url: self.endpoints.clone(),
            discovery_type: self.discovery,
            namespaces: self.namespaces.clone(),
        }
    }
}

/// A built-in service hosted on its own RPC listener.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendBlock {
    pub name: String,
    /// Defaults to `{name}-{server.node_id}`.
    #[serde(default)]
    pub id: Option<String>,
    /// Built-in handler kind (e.g. "echo").
    pub handler: String,
    /// RPC listen address; port 0 picks one.
    #[serde(default = "defaults::default_backend_address")]
    pub address: SocketAddr,
    #[serde(default)]
    pub policy: RoutePolicy,
    #[serde(default)]
    pub namespaces: Vec<String>,
}
