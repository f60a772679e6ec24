//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Core config struct definitions (Config, ServerConfig, ListenConfig)
//! - [`limits`]: Connection and frame limits (LimitsConfig)
//! - [`services`]: Routing, discovery, and service blocks
//! - [`defaults`]: serde default functions
//! - [`validation`]: startup validation

pub mod defaults;
mod limits;
mod services;
mod types;
pub mod validation;

pub use limits::LimitsConfig;
pub use services::{
    BackendBlock, DiscoveryConfig, DiscoveryKind, GatewayConfig, RouterConfig, RouterMode,
    ServiceBlock,
};
pub use types::{Config, ConfigError, ListenConfig, ServerConfig};
pub use validation::ValidationError;
