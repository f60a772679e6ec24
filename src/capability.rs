//! Capability traits the dispatcher is written against.
//!
//! Each component is reached through the narrow interface below rather than
//! its concrete type, so any one of them can live across a process boundary
//! (the router already can, see [`RouteClient`](crate::router::RouteClient))
//! and tests can substitute doubles.

use async_trait::async_trait;
use imgate_proto::{DeviceId, Gid, HandleRequest, Message, Response, Uid};
use std::sync::Arc;
use tracing::debug;

use crate::error::{GroupError, RegistryError, RouteError};
use crate::router::ServiceRouter;
use crate::state::{
    BatchReport, ConnectionRegistry, GroupInfo, GroupManager, GroupUpdate, MemberFlags,
    MemberUpdate, NotifyOutcome, PushOutcome,
};

/// Connection registry operations.
pub trait ClientManager: Send + Sync {
    /// Bind the connection known as `old` to `(uid, device)`.
    fn client_sign_in(&self, old: Uid, uid: Uid, device: DeviceId) -> Result<(), RegistryError>;

    /// Tear down every device of `uid`. Returns how many were removed.
    fn user_logout(&self, uid: Uid) -> usize;

    /// Push at one device. Absent targets are a silent no-op.
    fn enqueue_message(&self, uid: Uid, device: DeviceId, msg: Arc<Message>) -> PushOutcome;

    fn is_device_online(&self, uid: Uid, device: DeviceId) -> bool;

    /// Whether any device of `uid` is connected.
    fn is_online(&self, uid: Uid) -> bool;

    /// Every signed-in uid, sorted.
    fn all_client(&self) -> Vec<Uid>;

    /// Alias of [`user_logout`](Self::user_logout).
    fn client_logout(&self, uid: Uid) -> usize {
        self.user_logout(uid)
    }
}

/// Group presence operations.
pub trait GroupApi: Send + Sync {
    fn update_member(
        &self,
        gid: Gid,
        updates: Vec<MemberUpdate>,
    ) -> Result<BatchReport, GroupError>;

    fn update_group(&self, gid: Gid, update: GroupUpdate) -> Result<(), GroupError>;

    fn dispatch_notify_message(
        &self,
        gid: Gid,
        msg: Arc<Message>,
    ) -> Result<NotifyOutcome, GroupError>;

    /// Subscribe every online device of `uid`.
    fn member_online(&self, gid: Gid, uid: Uid) -> Result<BatchReport, GroupError>;

    /// Unsubscribe every device of `uid`.
    fn member_offline(&self, gid: Gid, uid: Uid) -> Result<BatchReport, GroupError>;

    fn group_info(&self, gid: Gid) -> Option<GroupInfo>;

    fn create_group(&self, gid: Gid, name: String, owner: Uid) -> Result<(), GroupError> {
        self.update_group(gid, GroupUpdate::Create { name, owner })
    }

    fn dissolve_group(&self, gid: Gid) -> Result<(), GroupError> {
        self.update_group(gid, GroupUpdate::Dissolve)
    }

    fn mute_group(&self, gid: Gid, mute: bool) -> Result<(), GroupError> {
        let update = if mute {
            GroupUpdate::Mute
        } else {
            GroupUpdate::CancelMute
        };
        self.update_group(gid, update)
    }

    /// Insert or update members with their flags.
    fn put_member(
        &self,
        gid: Gid,
        members: Vec<(Uid, MemberFlags)>,
    ) -> Result<BatchReport, GroupError> {
        let updates = members
            .into_iter()
            .map(|(uid, flags)| MemberUpdate::Add { uid, flags })
            .collect();
        self.update_member(gid, updates)
    }

    fn remove_member(&self, gid: Gid, uids: Vec<Uid>) -> Result<BatchReport, GroupError> {
        let updates = uids.into_iter().map(|uid| MemberUpdate::Del { uid }).collect();
        self.update_member(gid, updates)
    }
}

/// Action routing.
#[async_trait]
pub trait ActionRouter: Send + Sync {
    async fn route2(&self, action: &str, request: HandleRequest) -> Result<Response, RouteError>;
}

impl ClientManager for ConnectionRegistry {
    fn client_sign_in(&self, old: Uid, uid: Uid, device: DeviceId) -> Result<(), RegistryError> {
        ConnectionRegistry::client_sign_in(self, old, uid, device)
    }

    fn user_logout(&self, uid: Uid) -> usize {
        ConnectionRegistry::user_logout(self, uid)
    }

    fn enqueue_message(&self, uid: Uid, device: DeviceId, msg: Arc<Message>) -> PushOutcome {
        ConnectionRegistry::enqueue_message(self, uid, device, msg)
    }

    fn is_device_online(&self, uid: Uid, device: DeviceId) -> bool {
        ConnectionRegistry::is_device_online(self, uid, device)
    }

    fn is_online(&self, uid: Uid) -> bool {
        ConnectionRegistry::is_online(self, uid)
    }

    fn all_client(&self) -> Vec<Uid> {
        ConnectionRegistry::all_client(self)
    }

    fn client_logout(&self, uid: Uid) -> usize {
        ConnectionRegistry::client_logout(self, uid)
    }
}

impl GroupApi for GroupManager {
    fn update_member(
        &self,
        gid: Gid,
        updates: Vec<MemberUpdate>,
    ) -> Result<BatchReport, GroupError> {
        GroupManager::update_member(self, gid, updates)
    }

    fn update_group(&self, gid: Gid, update: GroupUpdate) -> Result<(), GroupError> {
        GroupManager::update_group(self, gid, update)
    }

    fn dispatch_notify_message(
        &self,
        gid: Gid,
        msg: Arc<Message>,
    ) -> Result<NotifyOutcome, GroupError> {
        GroupManager::dispatch_notify_message(self, gid, msg)
    }

    fn member_online(&self, gid: Gid, uid: Uid) -> Result<BatchReport, GroupError> {
        GroupManager::member_online(self, gid, uid)
    }

    fn member_offline(&self, gid: Gid, uid: Uid) -> Result<BatchReport, GroupError> {
        GroupManager::member_offline(self, gid, uid)
    }

    fn group_info(&self, gid: Gid) -> Option<GroupInfo> {
        GroupManager::group_info(self, gid)
    }
}

#[async_trait]
impl ActionRouter for ServiceRouter {
    async fn route2(&self, action: &str, request: HandleRequest) -> Result<Response, RouteError> {
        ServiceRouter::route2(self, action, request).await
    }
}

/// Push `msg` at `(uid, device)`.
pub fn send_message(
    clients: &dyn ClientManager,
    uid: Uid,
    device: DeviceId,
    msg: Arc<Message>,
) -> PushOutcome {
    let outcome = clients.enqueue_message(uid, device, msg);
    debug!(uid, device, ?outcome, "send_message");
    outcome
}

/// Push `msg` only if `(uid, device)` is connected right now. Returns
/// whether it was queued.
pub fn send_message_if_online(
    clients: &dyn ClientManager,
    uid: Uid,
    device: DeviceId,
    msg: Arc<Message>,
) -> bool {
    if !clients.is_device_online(uid, device) {
        return false;
    }
    send_message(clients, uid, device, msg).is_queued()
}
