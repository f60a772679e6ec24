//! # imgate-proto
//!
//! Wire-visible types shared by gateways, route nodes, and backend services.
//!
//! ## Features
//!
//! - [`Message`], the envelope exchanged with clients and backends
//! - Route-service requests ([`RegisterRequest`], [`Route2Request`]) and the
//!   RPC frames that carry them ([`rpc::RpcRequest`], [`rpc::RpcResponse`])
//! - Dotted action-string helpers ([`action`])
//! - Optional Tokio codec for newline-delimited JSON framing
//!
//! ## Quick Start
//!
//! ```rust
//! use imgate_proto::{action, Message};
//!
//! let msg = Message::new("api.app.echo", serde_json::json!("hello")).with_seq(1);
//! assert_eq!(msg.namespace(), "api");
//!
//! let prefixes: Vec<_> = action::prefixes(&msg.action).collect();
//! assert_eq!(prefixes, ["api.app.echo", "api.app", "api"]);
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod action;
pub mod error;
pub mod message;
pub mod rpc;

#[cfg(feature = "tokio")]
pub mod codec;
#[cfg(feature = "tokio")]
pub mod line;

pub use self::error::ProtocolError;
pub use self::message::{DeviceId, Gid, HandleRequest, Message, Response, Uid};
pub use self::rpc::{
    DeregisterRequest, DiscoveryType, FaultCode, RegisterRequest, Route2Request, RoutePolicy,
    RpcFault, RpcRequest, RpcResponse,
};

#[cfg(feature = "tokio")]
pub use self::codec::JsonCodec;
#[cfg(feature = "tokio")]
pub use self::line::LineCodec;
