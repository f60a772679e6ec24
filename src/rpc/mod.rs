//! Line-delimited JSON RPC over TCP.
//!
//! [`RpcServer`] hosts an [`RpcService`]; [`RpcClient`] multiplexes calls
//! over one connection by request id. Every call carries its own deadline.

pub mod client;
pub mod server;

pub use client::{ClientPool, RpcClient, RpcError};
pub use server::{RpcServer, RpcService};
