//! Connection registry.
//!
//! The ConnectionRegistry handles:
//! - Issuing connection ids for freshly accepted transports
//! - Binding connections to `(uid, device)` on sign-in
//! - Teardown on logout, eviction, supersession, and transport closure
//! - Point-to-point enqueue onto a device's outbound channel
//!
//! # Thread Safety
//!
//! Bound connections live in per-user-bucket shards, each behind its own
//! mutex, so unrelated users never contend. A sign-in that moves a device
//! between users locks both shards in ascending index order. Presence
//! observers are called with the shard lock held.
//!
//! Lock order: registry shard → group RwLock → group membership index.

use dashmap::DashMap;
use imgate_proto::{DeviceId, Message, Uid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info};

use crate::error::{DispatchError, DispatchResult, RegistryError};
use crate::state::dashmap_ext::DashMapExt;
use crate::state::uid::{ConnIdGenerator, is_temporary};
use crate::state::{
    Connection, InboundHandler, NewConnection, Outbound, OverflowPolicy, PresenceObserver,
    PushOutcome, Transport,
};

/// Registry sizing and overflow behavior.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Number of shards for bound connections.
    pub shards: usize,
    /// Outbound channel capacity per connection.
    pub outbound_capacity: usize,
    /// Full-channel behavior.
    pub overflow: OverflowPolicy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            shards: 64,
            outbound_capacity: 256,
            overflow: OverflowPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Shard {
    users: HashMap<Uid, HashMap<DeviceId, Arc<Connection>>>,
}

impl Shard {
    fn get(&self, uid: Uid, device: DeviceId) -> Option<&Arc<Connection>> {
        self.users.get(&uid).and_then(|devices| devices.get(&device))
    }

    fn take(&mut self, uid: Uid, device: DeviceId) -> Option<Arc<Connection>> {
        let devices = self.users.get_mut(&uid)?;
        let conn = devices.remove(&device);
        if devices.is_empty() {
            self.users.remove(&uid);
        }
        conn
    }
}

/// Tracks every live connection and which `(uid, device)` it serves.
pub struct ConnectionRegistry {
    shards: Box<[Mutex<Shard>]>,
    /// Accepted but not yet signed in, keyed by temporary uid.
    pending: DashMap<Uid, Arc<Connection>>,
    ids: ConnIdGenerator,
    settings: RegistrySettings,
    bound: AtomicUsize,
    observer: Option<Arc<dyn PresenceObserver>>,
    handler: OnceLock<Weak<dyn InboundHandler>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(settings: RegistrySettings) -> Self {
        let shards = (0..settings.shards.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        Self {
            shards,
            pending: DashMap::new(),
            ids: ConnIdGenerator::new(),
            settings,
            bound: AtomicUsize::new(0),
            observer: None,
            handler: OnceLock::new(),
        }
    }

    /// Attach a presence observer. Must happen before the registry is shared.
    pub fn with_observer(mut self, observer: Arc<dyn PresenceObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Attach the inbound handler. Only the first call takes effect.
    pub fn set_handler(&self, handler: Weak<dyn InboundHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    #[inline]
    fn shard_index(&self, uid: Uid) -> usize {
        uid.rem_euclid(self.shards.len() as i64) as usize
    }

    /// Register a freshly accepted transport. Never fails.
    pub fn client_connected(&self, transport: Transport) -> NewConnection {
        let id = self.ids.next();
        let (outbound, rx) = Outbound::channel(
            id,
            self.settings.outbound_capacity,
            transport.shutdown.clone(),
            self.settings.overflow,
        );
        let connection = Arc::new(Connection::new(id, transport, outbound));
        self.pending.insert(id, Arc::clone(&connection));
        crate::metrics::inc_connected();
        debug!(conn = id, peer = ?connection.peer, "client connected");
        NewConnection {
            id,
            connection,
            outbound: rx,
        }
    }

    /// Bind the connection known as `old` on `device` to `(uid, device)`.
    ///
    /// `old` is either the temporary uid of a pending connection or the uid
    /// currently bound on `device` (account switch). Any other connection
    /// already at `(uid, device)` is torn down first.
    pub fn client_sign_in(
        &self,
        old: Uid,
        uid: Uid,
        device: DeviceId,
    ) -> Result<(), RegistryError> {
        if is_temporary(uid) {
            return Err(RegistryError::ReservedUid(uid));
        }

        if let Some((_, conn)) = self.pending.remove(&old) {
            let mut shard = self.shards[self.shard_index(uid)].lock();
            if !conn.bind_if_live(uid, device) {
                return Err(RegistryError::ConnectionNotFound { uid: old, device });
            }
            self.install(&mut shard, uid, device, conn);
            info!(uid, device, "signed in");
            return Ok(());
        }

        if old == uid {
            let shard = self.shards[self.shard_index(uid)].lock();
            return match shard.get(uid, device) {
                Some(conn) if conn.is_live() => Ok(()),
                _ => Err(RegistryError::ConnectionNotFound { uid, device }),
            };
        }

        let (i, j) = (self.shard_index(old), self.shard_index(uid));
        if i == j {
            let mut shard = self.shards[i].lock();
            self.move_binding(&mut shard, None, old, uid, device)
        } else {
            let mut low = self.shards[i.min(j)].lock();
            let mut high = self.shards[i.max(j)].lock();
            let (src, dst) = if i < j {
                (&mut *low, &mut *high)
            } else {
                (&mut *high, &mut *low)
            };
            self.move_binding(src, Some(dst), old, uid, device)
        }
    }

    fn move_binding(
        &self,
        src: &mut Shard,
        dst: Option<&mut Shard>,
        old: Uid,
        uid: Uid,
        device: DeviceId,
    ) -> Result<(), RegistryError> {
        let conn = src
            .take(old, device)
            .ok_or(RegistryError::ConnectionNotFound { uid: old, device })?;
        self.bound.fetch_sub(1, Ordering::Relaxed);
        self.notify_offline(old, device);

        let dst = match dst {
            Some(dst) => dst,
            None => src,
        };
        conn.rebind(uid, device);
        self.install(dst, uid, device, conn);
        info!(old, uid, device, "account switched on device");
        Ok(())
    }

    /// Install `conn` at `(uid, device)`, superseding any previous occupant.
    fn install(&self, shard: &mut Shard, uid: Uid, device: DeviceId, conn: Arc<Connection>) {
        if let Some(prev) = shard.take(uid, device) {
            self.bound.fetch_sub(1, Ordering::Relaxed);
            self.retire(&prev);
            self.notify_offline(uid, device);
            debug!(uid, device, conn = prev.id(), "superseded previous connection");
        }
        if let Some(observer) = &self.observer {
            observer.on_device_online(uid, device, conn.outbound());
        }
        shard.users.entry(uid).or_default().insert(device, conn);
        self.bound.fetch_add(1, Ordering::Relaxed);
    }

    fn notify_offline(&self, uid: Uid, device: DeviceId) {
        if let Some(observer) = &self.observer {
            observer.on_device_offline(uid, device);
        }
    }

    fn retire(&self, conn: &Connection) {
        if conn.teardown() {
            crate::metrics::dec_connected();
        }
    }

    /// Tear down every connection bound to `uid`. Returns how many.
    pub fn user_logout(&self, uid: Uid) -> usize {
        if is_temporary(uid) {
            return match self.pending.remove(&uid) {
                Some((_, conn)) => {
                    self.retire(&conn);
                    1
                }
                None => 0,
            };
        }

        let mut shard = self.shards[self.shard_index(uid)].lock();
        let Some(devices) = shard.users.remove(&uid) else {
            return 0;
        };
        let count = devices.len();
        for (device, conn) in devices {
            self.retire(&conn);
            self.notify_offline(uid, device);
        }
        self.bound.fetch_sub(count, Ordering::Relaxed);
        info!(uid, devices = count, "user logged out");
        count
    }

    /// Alias of [`user_logout`](Self::user_logout).
    pub fn client_logout(&self, uid: Uid) -> usize {
        self.user_logout(uid)
    }

    /// Tear down the single connection at `(uid, device)`.
    pub fn logout_device(&self, uid: Uid, device: DeviceId) -> bool {
        let mut shard = self.shards[self.shard_index(uid)].lock();
        match shard.take(uid, device) {
            Some(conn) => {
                self.bound.fetch_sub(1, Ordering::Relaxed);
                self.retire(&conn);
                self.notify_offline(uid, device);
                true
            }
            None => false,
        }
    }

    fn lookup(&self, uid: Uid, device: DeviceId) -> Option<Arc<Connection>> {
        if is_temporary(uid) {
            return self.pending.get_cloned(&uid);
        }
        self.shards[self.shard_index(uid)]
            .lock()
            .get(uid, device)
            .cloned()
    }

    /// Push `msg` to `(uid, device)` if a live connection exists.
    ///
    /// Absent devices are a silent no-op. A push that trips the overflow
    /// policy or finds the channel closed evicts the connection.
    pub fn enqueue_message(&self, uid: Uid, device: DeviceId, msg: Arc<Message>) -> PushOutcome {
        let Some(conn) = self.lookup(uid, device) else {
            return PushOutcome::Absent;
        };
        let outcome = conn.outbound().push(msg);
        if outcome.needs_eviction() {
            crate::metrics::record_evicted();
            self.client_closed(&conn);
        }
        outcome
    }

    /// Whether `(uid, device)` has a live connection.
    pub fn is_device_online(&self, uid: Uid, device: DeviceId) -> bool {
        self.lookup(uid, device).is_some_and(|c| c.is_live())
    }

    /// Whether any device of `uid` has a live connection.
    pub fn is_online(&self, uid: Uid) -> bool {
        self.shards[self.shard_index(uid)]
            .lock()
            .users
            .get(&uid)
            .is_some_and(|devices| devices.values().any(|c| c.is_live()))
    }

    /// Snapshot of every signed-in uid, sorted.
    pub fn all_client(&self) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self
            .shards
            .iter()
            .flat_map(|shard| shard.lock().users.keys().copied().collect::<Vec<_>>())
            .collect();
        uids.sort_unstable();
        uids
    }

    /// Outbound handles for every device of `uid`.
    pub fn outbounds(&self, uid: Uid) -> Vec<(DeviceId, Outbound)> {
        let shard = self.shards[self.shard_index(uid)].lock();
        shard
            .users
            .get(&uid)
            .map(|devices| {
                devices
                    .iter()
                    .filter(|(_, c)| c.is_live())
                    .map(|(d, c)| (*d, c.outbound().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of connections bound to `(uid, device)` (0 or 1).
    pub fn device_connections(&self, uid: Uid, device: DeviceId) -> usize {
        usize::from(self.lookup(uid, device).is_some())
    }

    /// Number of signed-in connections.
    pub fn connection_count(&self) -> usize {
        self.bound.load(Ordering::Relaxed)
    }

    /// Number of connections awaiting sign-in.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Transport closed: drop `conn` from the registry.
    ///
    /// Only removes the binding while `conn` still holds it, so a connection
    /// that was already superseded never evicts its successor.
    pub fn client_closed(&self, conn: &Connection) {
        self.retire(conn);
        if self
            .pending
            .remove_if(&conn.id(), |_, c| c.id() == conn.id())
            .is_some()
        {
            debug!(conn = conn.id(), "pending connection closed");
            return;
        }

        loop {
            let (uid, device) = conn.binding();
            let mut shard = self.shards[self.shard_index(uid)].lock();
            // a concurrent sign-in may have moved the binding before we locked
            if conn.binding() != (uid, device) {
                continue;
            }
            if shard.get(uid, device).is_some_and(|c| c.id() == conn.id()) {
                shard.take(uid, device);
                self.bound.fetch_sub(1, Ordering::Relaxed);
                self.notify_offline(uid, device);
                debug!(uid, device, conn = conn.id(), "connection closed");
            }
            return;
        }
    }

    /// Entry point for messages originated by a connected client.
    pub async fn handle_message(
        &self,
        from: Uid,
        device: DeviceId,
        msg: Message,
    ) -> DispatchResult {
        let handler = self
            .handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or(DispatchError::Unavailable)?;
        handler.handle(from, device, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(bool, Uid, DeviceId)>>,
    }

    impl PresenceObserver for Recorder {
        fn on_device_online(&self, uid: Uid, device: DeviceId, _outbound: &Outbound) {
            self.events.lock().push((true, uid, device));
        }

        fn on_device_offline(&self, uid: Uid, device: DeviceId) {
            self.events.lock().push((false, uid, device));
        }
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(RegistrySettings {
            shards: 8,
            outbound_capacity: 4,
            overflow: OverflowPolicy::Disconnect,
        })
    }

    fn connect(reg: &ConnectionRegistry) -> NewConnection {
        reg.client_connected(Transport::detached())
    }

    fn msg() -> Arc<Message> {
        Arc::new(Message::new("push.test", Value::Null))
    }

    #[test]
    fn sign_in_binds_exactly_one_connection() {
        let reg = registry();
        for _ in 0..5 {
            let c = connect(&reg);
            reg.client_sign_in(c.id, 7, 1).unwrap();
            assert!(reg.is_device_online(7, 1));
            assert_eq!(reg.device_connections(7, 1), 1);
        }
        assert_eq!(reg.connection_count(), 1);
        assert_eq!(reg.pending_count(), 0);
        assert_eq!(reg.all_client(), vec![7]);
    }

    #[test]
    fn new_sign_in_tears_down_previous_occupant() {
        let reg = registry();
        let first = connect(&reg);
        reg.client_sign_in(first.id, 7, 1).unwrap();
        let second = connect(&reg);
        reg.client_sign_in(second.id, 7, 1).unwrap();

        assert!(!first.connection.is_live());
        assert!(first.connection.shutdown_token().is_cancelled());
        assert!(second.connection.is_live());
    }

    #[test]
    fn account_switch_takes_device_from_old_user() {
        let reg = registry();
        let c = connect(&reg);
        reg.client_sign_in(c.id, 7, 1).unwrap();
        // 7 and 15 share a shard with 8 shards; 7 and 10 do not
        for next in [15, 10] {
            let prev = reg.all_client()[0];
            reg.client_sign_in(prev, next, 1).unwrap();
            assert!(!reg.is_device_online(prev, 1));
            assert!(reg.is_device_online(next, 1));
            assert!(c.connection.is_live());
            assert_eq!(c.connection.binding(), (next, 1));
        }
        assert_eq!(reg.all_client(), vec![10]);
        assert_eq!(reg.connection_count(), 1);
    }

    #[test]
    fn switch_into_occupied_device_supersedes() {
        let reg = registry();
        let a = connect(&reg);
        reg.client_sign_in(a.id, 1, 3).unwrap();
        let b = connect(&reg);
        reg.client_sign_in(b.id, 2, 3).unwrap();

        reg.client_sign_in(1, 2, 3).unwrap();
        assert!(!b.connection.is_live());
        assert!(a.connection.is_live());
        assert!(!reg.is_online(1));
        assert!(reg.is_device_online(2, 3));
    }

    #[test]
    fn sign_in_errors() {
        let reg = registry();
        assert_eq!(
            reg.client_sign_in(99, 100, 1),
            Err(RegistryError::ConnectionNotFound { uid: 99, device: 1 })
        );
        let c = connect(&reg);
        assert_eq!(
            reg.client_sign_in(c.id, c.id, 1),
            Err(RegistryError::ReservedUid(c.id))
        );
        reg.client_sign_in(c.id, 5, 1).unwrap();
        assert_eq!(reg.client_sign_in(5, 5, 1), Ok(()));
    }

    #[test]
    fn logout_tears_down_every_device() {
        let reg = registry();
        let conns: Vec<_> = (0..3).map(|_| connect(&reg)).collect();
        for (device, c) in conns.iter().enumerate() {
            reg.client_sign_in(c.id, 4, device as DeviceId).unwrap();
        }
        assert_eq!(reg.user_logout(4), 3);
        assert!(!reg.is_online(4));
        assert!(conns.iter().all(|c| !c.connection.is_live()));
        assert_eq!(reg.user_logout(4), 0);
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn enqueue_to_absent_device_is_noop() {
        let reg = registry();
        assert_eq!(reg.enqueue_message(1, 1, msg()), PushOutcome::Absent);
    }

    #[tokio::test]
    async fn enqueue_reaches_pending_and_bound_connections() {
        let reg = registry();
        let mut c = connect(&reg);
        assert!(reg.enqueue_message(c.id, 0, msg()).is_queued());
        reg.client_sign_in(c.id, 3, 2).unwrap();
        assert!(reg.enqueue_message(3, 2, msg()).is_queued());
        assert_eq!(c.outbound.recv().await.unwrap().action, "push.test");
        assert_eq!(c.outbound.recv().await.unwrap().action, "push.test");
    }

    #[test]
    fn overflow_evicts_under_disconnect_policy() {
        let reg = registry();
        let c = connect(&reg);
        reg.client_sign_in(c.id, 3, 2).unwrap();
        for _ in 0..4 {
            assert!(reg.enqueue_message(3, 2, msg()).is_queued());
        }
        assert_eq!(reg.enqueue_message(3, 2, msg()), PushOutcome::Disconnected);
        assert!(!reg.is_device_online(3, 2));
        assert_eq!(reg.enqueue_message(3, 2, msg()), PushOutcome::Absent);
    }

    #[test]
    fn closed_superseded_connection_keeps_successor() {
        let reg = registry();
        let first = connect(&reg);
        reg.client_sign_in(first.id, 7, 1).unwrap();
        let second = connect(&reg);
        reg.client_sign_in(second.id, 7, 1).unwrap();

        reg.client_closed(&first.connection);
        assert!(reg.is_device_online(7, 1));

        reg.client_closed(&second.connection);
        assert!(!reg.is_device_online(7, 1));
    }

    #[test]
    fn observer_sees_ordered_presence() {
        let recorder = Arc::new(Recorder::default());
        let reg = registry().with_observer(recorder.clone());
        let a = connect(&reg);
        reg.client_sign_in(a.id, 1, 1).unwrap();
        let b = connect(&reg);
        reg.client_sign_in(b.id, 1, 1).unwrap();
        reg.client_sign_in(1, 2, 1).unwrap();
        reg.user_logout(2);

        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                (true, 1, 1),
                (false, 1, 1),
                (true, 1, 1),
                (false, 1, 1),
                (true, 2, 1),
                (false, 2, 1),
            ]
        );
    }

    #[tokio::test]
    async fn handle_message_without_handler_is_unavailable() {
        let reg = registry();
        let err = reg
            .handle_message(1, 0, Message::new("api.x", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable));
    }
}
