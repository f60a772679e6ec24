//! Network module.
//!
//! Contains the client gateway (TCP listener) and the per-connection
//! reader and writer tasks.

mod connection;
mod gateway;

pub use gateway::{ClientGateway, GatewaySettings};
