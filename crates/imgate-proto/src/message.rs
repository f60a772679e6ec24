//! The message envelope exchanged with clients and backend services.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User identifier.
pub type Uid = i64;

/// Device identifier, scoped to a user.
pub type DeviceId = i64;

/// Group identifier.
pub type Gid = i64;

/// An application message.
///
/// `seq` is assigned by the sender and echoed on replies so clients can
/// correlate and de-duplicate. `action` is a dot-separated handler address
/// such as `api.app.echo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender-assigned sequence number.
    #[serde(default)]
    pub seq: u64,
    /// Hierarchical action string.
    pub action: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Sender uid, stamped by the gateway (`0` for server-originated messages).
    #[serde(default)]
    pub from: Uid,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    /// Create a message with the given action and payload.
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            seq: 0,
            action: action.into(),
            data,
            from: 0,
            timestamp: 0,
        }
    }

    /// Set the sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Set the sender uid.
    #[must_use]
    pub fn with_sender(mut self, from: Uid) -> Self {
        self.from = from;
        self
    }

    /// Stamp the message with the current wall-clock time.
    #[must_use]
    pub fn stamped(mut self) -> Self {
        self.timestamp = chrono::Utc::now().timestamp_millis();
        self
    }

    /// Build a reply that echoes this message's `seq` and `action`.
    pub fn reply(&self, data: Value) -> Self {
        Self {
            seq: self.seq,
            action: self.action.clone(),
            data,
            from: 0,
            timestamp: 0,
        }
        .stamped()
    }

    /// The leading segment of the action string.
    pub fn namespace(&self) -> &str {
        crate::action::namespace(&self.action)
    }
}

/// A request forwarded to a backend service on behalf of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleRequest {
    /// The calling user (a temporary uid before sign-in).
    pub uid: Uid,
    /// The calling device, if known.
    #[serde(default)]
    pub device: DeviceId,
    /// The client's message.
    pub message: Message,
}

impl HandleRequest {
    /// Create a request for `uid` on device `0`.
    pub fn new(uid: Uid, message: Message) -> Self {
        Self {
            uid,
            device: 0,
            message,
        }
    }
}

/// A backend service's answer to a [`HandleRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The reply message.
    pub message: Message,
}
