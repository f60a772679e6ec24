//! Unified error handling for imgate.
//!
//! This module provides a centralized error hierarchy for the gateway core,
//! with automatic conversions, client reply generation, and metric labeling.

use imgate_proto::{DeviceId, FaultCode, Gid, Message, RpcFault, Uid};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::discovery::DiscoveryError;

// ============================================================================
// Registry Errors (connection bookkeeping)
// ============================================================================

/// Connection registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no connection for uid {uid} device {device}")]
    ConnectionNotFound { uid: Uid, device: DeviceId },

    #[error("uid {0} is in the reserved connection-id range")]
    ReservedUid(Uid),
}

impl RegistryError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound { .. } => "connection_not_found",
            Self::ReservedUid(_) => "reserved_uid",
        }
    }
}

// ============================================================================
// Group Errors (presence engine)
// ============================================================================

/// Group presence engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    #[error("no such group: {0}")]
    GroupNotFound(Gid),

    #[error("uid {uid} is not a member of group {gid}")]
    MembershipInconsistency { gid: Gid, uid: Uid },
}

impl GroupError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::GroupNotFound(_) => "group_not_found",
            Self::MembershipInconsistency { .. } => "membership_inconsistency",
        }
    }
}

// ============================================================================
// Route Errors (service router)
// ============================================================================

/// Service router errors.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error("no service claims action {0}")]
    RouteUnresolved(String),

    #[error("service {0} has no reachable instance")]
    RouteUnavailable(String),

    #[error("call to {service} timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("malformed action: {0:?}")]
    InvalidAction(String),

    #[error("remote fault: {0}")]
    Remote(RpcFault),

    #[error("discovery: {0}")]
    Discovery(#[from] DiscoveryError),
}

impl RouteError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RouteUnresolved(_) => "route_unresolved",
            Self::RouteUnavailable(_) => "route_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::InvalidAction(_) => "invalid_action",
            Self::Remote(fault) => fault.code.as_str(),
            Self::Discovery(_) => "discovery",
        }
    }

    /// Whether a caller may reasonably retry (possibly landing on another instance).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RouteUnavailable(_) | Self::Timeout { .. })
    }
}

impl From<RpcFault> for RouteError {
    fn from(fault: RpcFault) -> Self {
        match fault.code {
            FaultCode::RouteUnresolved => Self::RouteUnresolved(fault.message),
            FaultCode::RouteUnavailable => Self::RouteUnavailable(fault.message),
            _ => Self::Remote(fault),
        }
    }
}

impl From<&RouteError> for RpcFault {
    fn from(err: &RouteError) -> Self {
        match err {
            RouteError::RouteUnresolved(action) => {
                RpcFault::new(FaultCode::RouteUnresolved, action.clone())
            }
            RouteError::RouteUnavailable(service) => {
                RpcFault::new(FaultCode::RouteUnavailable, service.clone())
            }
            RouteError::Timeout { .. } => RpcFault::new(FaultCode::Timeout, err.to_string()),
            RouteError::InvalidAction(_) => RpcFault::new(FaultCode::BadRequest, err.to_string()),
            RouteError::Remote(fault) => fault.clone(),
            RouteError::Discovery(_) => RpcFault::new(FaultCode::Internal, err.to_string()),
        }
    }
}

// ============================================================================
// Dispatch Errors (inbound client messages)
// ============================================================================

/// Errors that can occur while dispatching a client message.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("bad payload for {action}: {reason}")]
    BadPayload { action: String, reason: String },

    #[error("sign in first")]
    NotSignedIn,

    #[error("grant for device {granted} does not match this connection's device {device}")]
    DeviceMismatch { device: DeviceId, granted: DeviceId },

    #[error("dispatcher unavailable")]
    Unavailable,
}

impl DispatchError {
    /// Build a [`DispatchError::BadPayload`] from any displayable cause.
    pub fn bad_payload(action: &str, reason: impl std::fmt::Display) -> Self {
        Self::BadPayload {
            action: action.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Group(e) => e.error_code(),
            Self::Route(e) => e.error_code(),
            Self::Registry(e) => e.error_code(),
            Self::BadPayload { .. } => "bad_payload",
            Self::NotSignedIn => "not_signed_in",
            Self::DeviceMismatch { .. } => "device_mismatch",
            Self::Unavailable => "unavailable",
        }
    }

    /// Convert to a client-visible error reply for `request`.
    ///
    /// The reply echoes the request's `seq` and `action` and carries
    /// `{"error": code, "message": text}` as data.
    pub fn to_reply(&self, request: &Message) -> Message {
        request.reply(json!({
            "error": self.error_code(),
            "message": self.to_string(),
        }))
    }
}

/// Result type for dispatch: an optional reply for the caller.
pub type DispatchResult = Result<Option<Message>, DispatchError>;

// ============================================================================
// Startup Errors (node assembly)
// ============================================================================

/// Errors that stop a node from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: String,
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("backend {name}: unknown handler {handler}")]
    UnknownHandler { name: String, handler: String },

    #[error("router.remote_address is not set")]
    MissingRemoteRouter,

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_roundtrip_keeps_route_class() {
        let err = RouteError::RouteUnresolved("nope.x".into());
        let back = RouteError::from(RpcFault::from(&err));
        assert!(matches!(back, RouteError::RouteUnresolved(a) if a == "nope.x"));

        let err = RouteError::Timeout {
            service: "api".into(),
            after: Duration::from_millis(5),
        };
        let back = RouteError::from(RpcFault::from(&err));
        assert_eq!(back.error_code(), "timeout");
    }

    #[test]
    fn dispatch_code_delegates() {
        let err = DispatchError::from(GroupError::GroupNotFound(3));
        assert_eq!(err.error_code(), "group_not_found");
        let err = DispatchError::from(RouteError::RouteUnavailable("api".into()));
        assert_eq!(err.error_code(), "route_unavailable");
    }

    #[test]
    fn reply_echoes_request() {
        let req = Message::new("group.mute", serde_json::Value::Null).with_seq(11);
        let reply = DispatchError::from(GroupError::GroupNotFound(9)).to_reply(&req);
        assert_eq!(reply.seq, 11);
        assert_eq!(reply.action, "group.mute");
        assert_eq!(reply.data["error"], "group_not_found");
        assert_eq!(reply.data["message"], "no such group: 9");
    }
}
