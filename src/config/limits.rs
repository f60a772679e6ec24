//! Connection and frame limits.

use serde::Deserialize;

use super::defaults;
use crate::state::OverflowPolicy;

/// Connection and frame limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Outbound channel capacity per connection (default: 256).
    #[serde(default = "defaults::default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Registry shard count (default: 64).
    #[serde(default = "defaults::default_registry_shards")]
    pub registry_shards: usize,
    /// Longest accepted frame in bytes, clients and RPC alike (default: 1 MiB).
    #[serde(default = "defaults::default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// What a full outbound channel does (default: disconnect).
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: defaults::default_outbound_capacity(),
            registry_shards: defaults::default_registry_shards(),
            max_frame_bytes: defaults::default_max_frame_bytes(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}
