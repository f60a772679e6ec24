//! Connection state.
//!
//! A [`Connection`] is one accepted client transport. It starts out pending
//! under a temporary uid (its own id) and is bound to a `(uid, device)` pair
//! on sign-in. The registry owns every connection from accept until teardown.
//!
//! # Architecture
//!
//! ```text
//! reader task ──handle_message──▶ registry ──▶ dispatcher
//!                                    │
//! writer task ◀──mpsc (bounded)── Outbound ◀── enqueue / group fan-out
//! ```

use chrono::{DateTime, Utc};
use imgate_proto::{DeviceId, Message, Uid};
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// What to do when a connection's outbound channel is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the message and keep the connection.
    Drop,
    /// Tear the connection down; a stalled peer must not hold messages hostage.
    #[default]
    Disconnect,
}

/// Result of pushing one message at one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted by the outbound channel.
    Queued,
    /// Channel full, message discarded ([`OverflowPolicy::Drop`]).
    Dropped,
    /// Channel full, connection torn down ([`OverflowPolicy::Disconnect`]).
    Disconnected,
    /// The connection is already gone.
    Closed,
    /// No connection for the target (silent no-op).
    Absent,
}

impl PushOutcome {
    /// Whether the message reached the outbound channel.
    #[inline]
    pub fn is_queued(self) -> bool {
        self == Self::Queued
    }

    /// Whether the connection should be evicted from the registry.
    #[inline]
    pub fn needs_eviction(self) -> bool {
        matches!(self, Self::Disconnected | Self::Closed)
    }
}

/// Sending half of a connection's outbound channel.
///
/// Cheap to clone. Group subscriber sets hold clones so fan-out never has to
/// touch the registry.
#[derive(Debug, Clone)]
pub struct Outbound {
    conn_id: Uid,
    tx: mpsc::Sender<Arc<Message>>,
    shutdown: CancellationToken,
    policy: OverflowPolicy,
}

impl Outbound {
    /// Create an outbound handle and its receiving half.
    pub fn channel(
        conn_id: Uid,
        capacity: usize,
        shutdown: CancellationToken,
        policy: OverflowPolicy,
    ) -> (Self, mpsc::Receiver<Arc<Message>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                conn_id,
                tx,
                shutdown,
                policy,
            },
            rx,
        )
    }

    /// Id of the connection this handle feeds.
    #[inline]
    pub fn conn_id(&self) -> Uid {
        self.conn_id
    }

    /// Non-blocking push. Never waits on a slow peer.
    pub fn push(&self, msg: Arc<Message>) -> PushOutcome {
        if self.shutdown.is_cancelled() {
            return PushOutcome::Closed;
        }
        match self.tx.try_send(msg) {
            Ok(()) => {
                crate::metrics::record_enqueued();
                PushOutcome::Queued
            }
            Err(TrySendError::Full(_)) => match self.policy {
                OverflowPolicy::Drop => {
                    crate::metrics::record_dropped();
                    PushOutcome::Dropped
                }
                OverflowPolicy::Disconnect => {
                    tracing::warn!(conn = self.conn_id, "outbound full, disconnecting");
                    self.shutdown.cancel();
                    PushOutcome::Disconnected
                }
            },
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Whether the connection behind this handle has been shut down.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

/// Transport-side handle supplied when a connection is accepted.
#[derive(Debug, Clone)]
pub struct Transport {
    /// Remote address, when the transport has one.
    pub peer: Option<SocketAddr>,
    /// Cancelled to make the reader and writer tasks stop.
    pub shutdown: CancellationToken,
}

impl Transport {
    /// A transport with the given peer and a fresh shutdown token.
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            peer,
            shutdown: CancellationToken::new(),
        }
    }

    /// A transport with no network peer (in-process clients, tests).
    pub fn detached() -> Self {
        Self::new(None)
    }
}

/// Current owner of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    uid: Uid,
    device: DeviceId,
}

/// One live client transport.
#[derive(Debug)]
pub struct Connection {
    id: Uid,
    binding: Mutex<Binding>,
    outbound: Outbound,
    live: AtomicBool,
    /// Remote address.
    pub peer: Option<SocketAddr>,
    /// Accept time.
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub(crate) fn new(id: Uid, transport: Transport, outbound: Outbound) -> Self {
        Self {
            id,
            binding: Mutex::new(Binding { uid: id, device: 0 }),
            outbound,
            live: AtomicBool::new(true),
            peer: transport.peer,
            connected_at: Utc::now(),
        }
    }

    /// Connection id (also the temporary uid while pending).
    #[inline]
    pub fn id(&self) -> Uid {
        self.id
    }

    /// Current `(uid, device)` binding. Pending connections report
    /// `(id, 0)`.
    pub fn binding(&self) -> (Uid, DeviceId) {
        let b = *self.binding.lock();
        (b.uid, b.device)
    }

    /// Whether the connection has been bound to a user.
    pub fn is_signed_in(&self) -> bool {
        self.binding.lock().uid != self.id
    }

    pub(crate) fn rebind(&self, uid: Uid, device: DeviceId) {
        *self.binding.lock() = Binding { uid, device };
    }

    /// Rebind unless already torn down. The liveness check and the rebind
    /// happen under the binding lock, so a concurrent close either wins or
    /// observes the new binding.
    pub(crate) fn bind_if_live(&self, uid: Uid, device: DeviceId) -> bool {
        let mut binding = self.binding.lock();
        if !self.is_live() {
            return false;
        }
        *binding = Binding { uid, device };
        true
    }

    /// The outbound handle.
    #[inline]
    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Shutdown token shared with the reader and writer tasks.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.outbound.shutdown
    }

    /// Whether the connection is still live.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && !self.outbound.shutdown.is_cancelled()
    }

    /// Mark dead and signal the transport. Returns `true` on the first call.
    pub(crate) fn teardown(&self) -> bool {
        let first = self.live.swap(false, Ordering::AcqRel);
        self.outbound.shutdown.cancel();
        first
    }
}

/// A connection just accepted by the registry.
pub struct NewConnection {
    /// Connection id, usable as the temporary uid.
    pub id: Uid,
    /// Shared connection state.
    pub connection: Arc<Connection>,
    /// Receiving half of the outbound channel, drained by the writer task.
    pub outbound: mpsc::Receiver<Arc<Message>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn msg() -> Arc<Message> {
        Arc::new(Message::new("push.test", Value::Null))
    }

    #[test]
    fn full_channel_drops_under_drop_policy() {
        let (out, _rx) = Outbound::channel(1, 1, CancellationToken::new(), OverflowPolicy::Drop);
        assert_eq!(out.push(msg()), PushOutcome::Queued);
        assert_eq!(out.push(msg()), PushOutcome::Dropped);
        assert!(!out.is_closed());
    }

    #[test]
    fn full_channel_disconnects_under_disconnect_policy() {
        let token = CancellationToken::new();
        let (out, _rx) = Outbound::channel(1, 1, token.clone(), OverflowPolicy::Disconnect);
        assert_eq!(out.push(msg()), PushOutcome::Queued);
        assert_eq!(out.push(msg()), PushOutcome::Disconnected);
        assert!(token.is_cancelled());
        assert_eq!(out.push(msg()), PushOutcome::Closed);
    }

    #[test]
    fn dropped_receiver_reports_closed() {
        let (out, rx) = Outbound::channel(1, 4, CancellationToken::new(), OverflowPolicy::Drop);
        drop(rx);
        assert_eq!(out.push(msg()), PushOutcome::Closed);
    }

    #[test]
    fn teardown_is_reported_once() {
        let transport = Transport::detached();
        let (out, _rx) = Outbound::channel(5, 4, transport.shutdown.clone(), OverflowPolicy::Drop);
        let conn = Connection::new(5, transport.clone(), out);
        assert!(!conn.is_signed_in());
        assert!(conn.teardown());
        assert!(!conn.teardown());
        assert!(transport.shutdown.is_cancelled());
        assert!(!conn.is_live());
    }
}
