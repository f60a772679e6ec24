//! Client action dispatch.
//!
//! [`classify`] is the single place that interprets an action string. Group
//! administration goes to the presence engine, `push.*` to the registry,
//! `session.*` is handled locally (sign-in through the auth backend), and
//! everything else is forwarded through the router.

mod forward;
mod group;
mod push;
mod session;

use async_trait::async_trait;
use imgate_proto::{DeviceId, Message, Uid};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, Level, debug, span};

use crate::capability::{ActionRouter, ClientManager, GroupApi};
use crate::error::{DispatchError, DispatchResult};
use crate::state::{InboundHandler, is_temporary};
use crate::telemetry::ActionTimer;

/// Action the auth backend answers by default.
pub const DEFAULT_AUTH_ACTION: &str = "api.auth.signin";

/// Group administration actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Create,
    Dissolve,
    Mute,
    MemberPut,
    MemberRemove,
    MemberOnline,
    MemberOffline,
    Notify,
}

/// Where an action is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Group(GroupAction),
    Push { only_if_online: bool },
    SignIn,
    Logout,
    Forward,
}

impl Route {
    /// Bounded metric label for an action taking this route.
    pub fn label(self, action: &str) -> &str {
        match self {
            Self::Forward => imgate_proto::action::namespace(action),
            _ => action,
        }
    }
}

/// Decide where `action` is handled.
pub fn classify(action: &str) -> Route {
    match action {
        "group.create" => Route::Group(GroupAction::Create),
        "group.dissolve" => Route::Group(GroupAction::Dissolve),
        "group.mute" => Route::Group(GroupAction::Mute),
        "group.member.put" => Route::Group(GroupAction::MemberPut),
        "group.member.remove" => Route::Group(GroupAction::MemberRemove),
        "group.member.online" => Route::Group(GroupAction::MemberOnline),
        "group.member.offline" => Route::Group(GroupAction::MemberOffline),
        "group.notify" => Route::Group(GroupAction::Notify),
        "push.send" => Route::Push {
            only_if_online: false,
        },
        "push.send_if_online" => Route::Push {
            only_if_online: true,
        },
        "session.signin" => Route::SignIn,
        "session.logout" => Route::Logout,
        _ => Route::Forward,
    }
}

/// Decode an action payload.
pub(crate) fn payload<T: DeserializeOwned>(msg: &Message) -> Result<T, DispatchError> {
    T::deserialize(&msg.data).map_err(|e| DispatchError::bad_payload(&msg.action, e))
}

/// Routes client messages to the component that owns them.
pub struct Dispatcher {
    clients: Arc<dyn ClientManager>,
    groups: Arc<dyn GroupApi>,
    router: Arc<dyn ActionRouter>,
    auth_action: String,
}

impl Dispatcher {
    pub fn new(
        clients: Arc<dyn ClientManager>,
        groups: Arc<dyn GroupApi>,
        router: Arc<dyn ActionRouter>,
        auth_action: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            groups,
            router,
            auth_action: auth_action.into(),
        }
    }

    /// Handle one message from `from` on `device`.
    ///
    /// `msg.from` is overwritten with the caller's uid.
    pub async fn dispatch(&self, from: Uid, device: DeviceId, msg: Message) -> DispatchResult {
        let route = classify(&msg.action);
        if is_temporary(from) && route != Route::SignIn {
            return Err(DispatchError::NotSignedIn);
        }
        let msg = msg.with_sender(from);
        match route {
            Route::Group(action) => group::handle(self.groups.as_ref(), action, &msg),
            Route::Push { only_if_online } => {
                push::handle(self.clients.as_ref(), only_if_online, &msg)
            }
            Route::SignIn => {
                session::sign_in(
                    self.clients.as_ref(),
                    self.router.as_ref(),
                    &self.auth_action,
                    from,
                    device,
                    msg,
                )
                .await
            }
            Route::Logout => session::logout(self.clients.as_ref(), from, &msg),
            Route::Forward => forward::handle(self.router.as_ref(), from, device, msg).await,
        }
    }
}

#[async_trait]
impl InboundHandler for Dispatcher {
    async fn handle(&self, from: Uid, device: DeviceId, msg: Message) -> DispatchResult {
        let route = classify(&msg.action);
        let mut timer = ActionTimer::new(route.label(&msg.action));
        let action_span = span!(
            Level::DEBUG,
            "action",
            action = %msg.action,
            seq = msg.seq,
            uid = from,
            device,
        );
        let result = self.dispatch(from, device, msg).instrument(action_span).await;
        if let Err(e) = &result {
            timer.fail(e.error_code());
            debug!(uid = from, device, error = %e, "action failed");
        }
        result
    }
}

/// `data` of a reply, for handlers that answer with a summary.
pub(crate) fn reply(msg: &Message, data: Value) -> DispatchResult {
    Ok(Some(msg.reply(data)))
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory doubles for the capability traits.

    use super::*;
    use crate::error::{GroupError, RegistryError, RouteError};
    use crate::state::{
        BatchReport, GroupInfo, GroupManager, GroupUpdate, MemberUpdate, NotifyOutcome,
        PushOutcome,
    };
    use imgate_proto::{Gid, HandleRequest, Response};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every call; a configurable set of devices is online.
    #[derive(Default)]
    pub struct CountingClients {
        pub online: Mutex<HashSet<(Uid, DeviceId)>>,
        pub enqueued: Mutex<Vec<(Uid, DeviceId, Arc<Message>)>>,
        pub enqueue_calls: AtomicUsize,
        pub sign_ins: Mutex<Vec<(Uid, Uid, DeviceId)>>,
        pub logouts: Mutex<Vec<Uid>>,
    }

    impl CountingClients {
        pub fn with_online(devices: &[(Uid, DeviceId)]) -> Self {
            let me = Self::default();
            me.online.lock().extend(devices.iter().copied());
            me
        }

        pub fn enqueue_calls(&self) -> usize {
            self.enqueue_calls.load(Ordering::SeqCst)
        }
    }

    impl ClientManager for CountingClients {
        fn client_sign_in(
            &self,
            old: Uid,
            uid: Uid,
            device: DeviceId,
        ) -> Result<(), RegistryError> {
            self.sign_ins.lock().push((old, uid, device));
            self.online.lock().insert((uid, device));
            Ok(())
        }

        fn user_logout(&self, uid: Uid) -> usize {
            self.logouts.lock().push(uid);
            let mut online = self.online.lock();
            let before = online.len();
            online.retain(|(u, _)| *u != uid);
            before - online.len()
        }

        fn enqueue_message(&self, uid: Uid, device: DeviceId, msg: Arc<Message>) -> PushOutcome {
            self.enqueue_calls.fetch_add(1, Ordering::SeqCst);
            if !self.online.lock().contains(&(uid, device)) {
                return PushOutcome::Absent;
            }
            self.enqueued.lock().push((uid, device, msg));
            PushOutcome::Queued
        }

        fn is_device_online(&self, uid: Uid, device: DeviceId) -> bool {
            self.online.lock().contains(&(uid, device))
        }

        fn is_online(&self, uid: Uid) -> bool {
            self.online.lock().iter().any(|(u, _)| *u == uid)
        }

        fn all_client(&self) -> Vec<Uid> {
            let mut uids: Vec<_> = self.online.lock().iter().map(|(u, _)| *u).collect();
            uids.sort_unstable();
            uids.dedup();
            uids
        }
    }

    /// Router double answering from a closure.
    pub struct FnRouter<F>(F);

    impl<F> FnRouter<F>
    where
        F: Fn(&str, HandleRequest) -> Result<Response, RouteError> + Send + Sync,
    {
        pub fn new(f: F) -> Self {
            Self(f)
        }
    }

    #[async_trait]
    impl<F> ActionRouter for FnRouter<F>
    where
        F: Fn(&str, HandleRequest) -> Result<Response, RouteError> + Send + Sync,
    {
        async fn route2(
            &self,
            action: &str,
            request: HandleRequest,
        ) -> Result<Response, RouteError> {
            (self.0)(action, request)
        }
    }

    /// A router that resolves nothing.
    pub fn no_routes() -> Arc<dyn ActionRouter> {
        Arc::new(FnRouter::new(|action, _req| {
            Err(RouteError::RouteUnresolved(action.to_string()))
        }))
    }

    /// Group double that records batches and forwards to a real engine.
    #[derive(Default)]
    pub struct RecordingGroups {
        pub inner: GroupManager,
        pub batches: Mutex<Vec<(Gid, usize)>>,
    }

    impl GroupApi for RecordingGroups {
        fn update_member(
            &self,
            gid: Gid,
            updates: Vec<MemberUpdate>,
        ) -> Result<BatchReport, GroupError> {
            self.batches.lock().push((gid, updates.len()));
            self.inner.update_member(gid, updates)
        }

        fn update_group(&self, gid: Gid, update: GroupUpdate) -> Result<(), GroupError> {
            self.inner.update_group(gid, update)
        }

        fn dispatch_notify_message(
            &self,
            gid: Gid,
            msg: Arc<Message>,
        ) -> Result<NotifyOutcome, GroupError> {
            self.inner.dispatch_notify_message(gid, msg)
        }

        fn member_online(&self, gid: Gid, uid: Uid) -> Result<BatchReport, GroupError> {
            self.inner.member_online(gid, uid)
        }

        fn member_offline(&self, gid: Gid, uid: Uid) -> Result<BatchReport, GroupError> {
            self.inner.member_offline(gid, uid)
        }

        fn group_info(&self, gid: Gid) -> Option<GroupInfo> {
            self.inner.group_info(gid)
        }
    }
}
