//! Hooks the connection registry calls out through.
//!
//! The registry is the source of truth for reachability. Anything that caches
//! presence (the group engine) listens through [`PresenceObserver`]; inbound
//! client traffic leaves the registry through [`InboundHandler`].

use async_trait::async_trait;
use imgate_proto::{DeviceId, Message, Uid};

use crate::error::DispatchResult;
use crate::state::Outbound;

/// Trait for observing device presence changes.
///
/// Called while the registry holds the shard lock for `uid`, so events for
/// one user arrive in order. Implementations must not call back into the
/// registry.
pub trait PresenceObserver: Send + Sync {
    /// A device was bound to `uid` and is reachable through `outbound`.
    fn on_device_online(&self, uid: Uid, device: DeviceId, outbound: &Outbound);

    /// The binding of `(uid, device)` was torn down.
    fn on_device_offline(&self, uid: Uid, device: DeviceId);
}

/// Trait for handling messages originated by a connected client.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle `msg` from `from` on `device`, returning an optional reply for
    /// the caller's own connection.
    async fn handle(&self, from: Uid, device: DeviceId, msg: Message) -> DispatchResult;
}
