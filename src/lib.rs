//! imgate - distributed instant-messaging gateway.
//!
//! Tracks live client connections, fans group notifications out to online
//! members, and forwards every other action to backend services through a
//! discovery-driven router.

pub mod capability;
pub mod config;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod network;
pub mod node;
pub mod router;
pub mod rpc;
pub mod services;
pub mod state;
pub mod telemetry;

pub use config::Config;
pub use node::{Node, RouterHandle};
