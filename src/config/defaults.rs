//! Default value functions for configuration.
//!
//! Separated into its own module for clarity and reuse.

use std::net::SocketAddr;

// =============================================================================
// Server Defaults
// =============================================================================

pub fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4().simple())
}

// =============================================================================
// Limits Defaults
// =============================================================================

pub fn default_outbound_capacity() -> usize {
    256
}

pub fn default_registry_shards() -> usize {
    64
}

pub fn default_max_frame_bytes() -> usize {
    imgate_proto::line::DEFAULT_MAX_LEN
}

// =============================================================================
// Router Defaults
// =============================================================================

pub fn default_call_timeout_ms() -> u64 {
    3000
}

pub fn default_connect_timeout_ms() -> u64 {
    1000
}

pub fn default_health_interval_secs() -> u64 {
    10
}

// =============================================================================
// Discovery Defaults
// =============================================================================

pub fn default_lease_ttl_secs() -> u64 {
    10
}

pub fn default_reaper_interval_ms() -> u64 {
    500
}

// =============================================================================
// Gateway Defaults
// =============================================================================

pub fn default_auth_action() -> String {
    crate::handlers::DEFAULT_AUTH_ACTION.to_string()
}

pub fn default_backend_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}
