//! RPC frames and route-service request types.
//!
//! Every frame is one JSON object on its own line. Requests carry a caller
//! chosen `id` that the matching response echoes, so many calls can be in
//! flight on one connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::message::HandleRequest;

/// Method names understood by imgate RPC servers.
pub mod method {
    /// Service self-registration (route service).
    pub const REGISTER: &str = "Register";
    /// Service removal (route service).
    pub const DEREGISTER: &str = "Deregister";
    /// Resolve and forward an action (route service).
    pub const ROUTE2: &str = "Route2";
    /// Handle a forwarded action (backend services).
    pub const HANDLE: &str = "Handle";
    /// Liveness check, answered by every server.
    pub const PING: &str = "Ping";
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id.
    pub id: u64,
    /// Method name, see [`method`].
    pub method: String,
    /// Method-specific body.
    #[serde(default)]
    pub body: Value,
}

/// A response frame. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation id of the request being answered.
    pub id: u64,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcFault>,
}

impl RpcResponse {
    /// Successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response.
    pub fn fault(id: u64, fault: RpcFault) -> Self {
        Self {
            id,
            result: None,
            error: Some(fault),
        }
    }

    /// Collapse into a `Result`. A frame with neither field is treated as a
    /// `null` result.
    pub fn into_result(self) -> Result<Value, RpcFault> {
        match self.error {
            Some(fault) => Err(fault),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Machine-readable failure class carried across RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    /// No service claims the action's namespace.
    RouteUnresolved,
    /// The service has no reachable instance.
    RouteUnavailable,
    /// The call did not complete within its deadline.
    Timeout,
    /// The body did not decode.
    BadRequest,
    /// The server does not implement the method.
    UnknownMethod,
    /// The backend handler refused or failed the action.
    Handler,
    /// Anything else.
    Internal,
}

impl FaultCode {
    /// Stable string form, used in logs and client replies.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RouteUnresolved => "route_unresolved",
            Self::RouteUnavailable => "route_unavailable",
            Self::Timeout => "timeout",
            Self::BadRequest => "bad_request",
            Self::UnknownMethod => "unknown_method",
            Self::Handler => "handler",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error answer to an RPC request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    /// Failure class.
    pub code: FaultCode,
    /// Human-readable detail.
    pub message: String,
}

impl RpcFault {
    /// Create a fault.
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a [`FaultCode::BadRequest`] fault.
    pub fn bad_request(message: impl fmt::Display) -> Self {
        Self::new(FaultCode::BadRequest, message.to_string())
    }

    /// Shorthand for a [`FaultCode::UnknownMethod`] fault.
    pub fn unknown_method(method: &str) -> Self {
        Self::new(FaultCode::UnknownMethod, format!("unknown method: {method}"))
    }
}

impl fmt::Display for RpcFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcFault {}

/// How a router picks one instance among a service's healthy instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Rotate through instances.
    #[default]
    RoundRobin,
    /// Stick each uid to one instance via a hash ring.
    ConsistentHash,
    /// Uniformly random.
    Random,
}

/// Where a service's instance addresses come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryType {
    /// Instances announce themselves in the coordination store.
    #[default]
    Coordinator,
    /// The registration's address list is the instance list.
    Static,
}

/// Body of a `Register` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Service id, stable across restarts.
    pub srv_id: String,
    /// Service name; also the namespace it claims.
    pub srv_name: String,
    /// Instance selection policy.
    #[serde(default)]
    pub route_policy: RoutePolicy,
    /// Coordination endpoints, or instance addresses for static discovery.
    #[serde(default)]
    pub discovery_srv_url: Vec<String>,
    /// Address source.
    #[serde(default)]
    pub discovery_type: DiscoveryType,
    /// Extra namespaces claimed besides `srv_name`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

impl RegisterRequest {
    /// A registration whose id equals its name, with default policy and
    /// coordinator discovery.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            srv_id: name.clone(),
            srv_name: name,
            route_policy: RoutePolicy::default(),
            discovery_srv_url: Vec::new(),
            discovery_type: DiscoveryType::default(),
            namespaces: Vec::new(),
        }
    }
}

/// Body of `Route2` and `Handle` calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route2Request {
    /// Action to resolve.
    pub action: String,
    /// The forwarded request.
    pub request: HandleRequest,
}

/// Body of a `Deregister` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterRequest {
    /// Service name to remove.
    pub srv_name: String,
}
