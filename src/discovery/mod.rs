//! Service discovery.
//!
//! A watchable key-value coordination store. Routers publish registrations
//! under `/routes/{name}`, backend instances announce themselves under
//! `/services/{name}/{id}` with a lease, and every router follows both
//! prefixes to keep its route table current.
//!
//! - [`memory`]: in-process store for single-node deployments and tests
//! - [`announcer`]: lease-backed self-registration for backend instances

pub mod announcer;
pub mod memory;

pub use announcer::Announcer;
pub use memory::MemoryDiscovery;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Lease handle.
pub type LeaseId = u64;

/// Key prefix for service registrations.
pub const ROUTES_PREFIX: &str = "/routes/";

/// Key prefix for live instances.
pub const SERVICES_PREFIX: &str = "/services/";

/// Registration key for `service`.
pub fn route_key(service: &str) -> String {
    format!("{ROUTES_PREFIX}{service}")
}

/// Instance key for `id` of `service`.
pub fn instance_key(service: &str, id: &str) -> String {
    format!("{SERVICES_PREFIX}{service}/{id}")
}

/// Service name of a registration key.
pub fn parse_route_key(key: &str) -> Option<&str> {
    key.strip_prefix(ROUTES_PREFIX).filter(|name| !name.is_empty())
}

/// `(service, id)` of an instance key.
pub fn parse_instance_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(SERVICES_PREFIX)?;
    let (service, id) = rest.split_once('/')?;
    (!service.is_empty() && !id.is_empty()).then_some((service, id))
}

/// Value stored under an instance key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub service: String,
    /// RPC address, `host:port`.
    pub addr: String,
}

/// A change to a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchEventKind,
}

/// Kind of watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Put { value: String },
    Delete,
}

/// Discovery store errors.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),
    #[error("discovery store closed")]
    Closed,
    #[error("bad record under {key}: {reason}")]
    BadRecord { key: String, reason: String },
}

/// Watch stream errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WatchError {
    /// The watcher fell behind and missed events. Resync from a snapshot.
    #[error("watcher lagged by {0} events")]
    Lagged(u64),
    #[error("watch closed")]
    Closed,
}

/// Event stream for one prefix.
pub struct Watcher {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl Watcher {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Next event under the watched prefix.
    pub async fn recv(&mut self) -> Result<WatchEvent, WatchError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(WatchError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }
}

/// A watchable key-value coordination service.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Grant a lease that expires unless kept alive within `ttl`.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, DiscoveryError>;

    /// Refresh a lease.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), DiscoveryError>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), DiscoveryError>;

    /// Write `key`, optionally attached to a lease.
    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>)
    -> Result<(), DiscoveryError>;

    /// Delete `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, DiscoveryError>;

    /// Every `(key, value)` under `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, DiscoveryError>;

    /// Snapshot `prefix` and subscribe to subsequent changes with no gap.
    async fn watch(&self, prefix: &str)
    -> Result<(Vec<(String, String)>, Watcher), DiscoveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(route_key("api"), "/routes/api");
        assert_eq!(parse_route_key("/routes/api"), Some("api"));
        assert_eq!(parse_route_key("/routes/"), None);

        let key = instance_key("api", "api-1");
        assert_eq!(key, "/services/api/api-1");
        assert_eq!(parse_instance_key(&key), Some(("api", "api-1")));
        assert_eq!(parse_instance_key("/services/api"), None);
    }
}
