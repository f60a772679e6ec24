//! In-process discovery store.
//!
//! Snapshots and subscriptions are taken under the same lock that publishes
//! events, so a watcher never misses a change between its snapshot and its
//! first event.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Discovery, DiscoveryError, LeaseId, WatchEvent, WatchEventKind, Watcher};

const EVENT_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    kv: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

/// Discovery store held in process memory.
pub struct MemoryDiscovery {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                next_lease: 1,
                ..Inner::default()
            }),
            events,
        }
    }

    fn emit(&self, key: String, kind: WatchEventKind) {
        // no receivers is fine
        let _ = self.events.send(WatchEvent { key, kind });
    }

    fn remove_locked(&self, inner: &mut Inner, key: &str) -> bool {
        let Some(entry) = inner.kv.remove(key) else {
            return false;
        };
        if let Some(lease) = entry.lease.and_then(|id| inner.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        self.emit(key.to_string(), WatchEventKind::Delete);
        true
    }

    fn revoke_locked(&self, inner: &mut Inner, id: LeaseId) -> bool {
        let Some(lease) = inner.leases.remove(&id) else {
            return false;
        };
        let mut keys: Vec<_> = lease.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            if inner.kv.remove(&key).is_some() {
                self.emit(key, WatchEventKind::Delete);
            }
        }
        true
    }

    /// Revoke every lease whose deadline is at or before `now`.
    pub fn expire_leases(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.revoke_locked(&mut inner, *id);
            info!(lease = id, "lease expired");
        }
        expired.len()
    }

    /// Spawn a task that expires leases every `interval`.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        store.expire_leases(Instant::now());
                    }
                }
            }
            debug!("lease reaper stopped");
        })
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

fn scan(kv: &BTreeMap<String, Entry>, prefix: &str) -> Vec<(String, String)> {
    kv.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, e)| (k.clone(), e.value.clone()))
        .collect()
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, DiscoveryError> {
        let mut inner = self.inner.lock();
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, id: LeaseId) -> Result<(), DiscoveryError> {
        let mut inner = self.inner.lock();
        let lease = inner
            .leases
            .get_mut(&id)
            .ok_or(DiscoveryError::LeaseNotFound(id))?;
        lease.deadline = Instant::now() + lease.ttl;
        Ok(())
    }

    async fn revoke(&self, id: LeaseId) -> Result<(), DiscoveryError> {
        let mut inner = self.inner.lock();
        if self.revoke_locked(&mut inner, id) {
            Ok(())
        } else {
            Err(DiscoveryError::LeaseNotFound(id))
        }
    }

    async fn put(
        &self,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> Result<(), DiscoveryError> {
        let mut inner = self.inner.lock();
        if let Some(id) = lease {
            let lease = inner
                .leases
                .get_mut(&id)
                .ok_or(DiscoveryError::LeaseNotFound(id))?;
            lease.keys.insert(key.to_string());
        }
        let previous = inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        if let Some(old) = previous.and_then(|e| e.lease).filter(|old| Some(*old) != lease) {
            if let Some(old) = inner.leases.get_mut(&old) {
                old.keys.remove(key);
            }
        }
        self.emit(key.to_string(), WatchEventKind::Put { value });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, DiscoveryError> {
        let mut inner = self.inner.lock();
        Ok(self.remove_locked(&mut inner, key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, DiscoveryError> {
        Ok(scan(&self.inner.lock().kv, prefix))
    }

    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<(Vec<(String, String)>, Watcher), DiscoveryError> {
        let inner = self.inner.lock();
        let snapshot = scan(&inner.kv, prefix);
        let rx = self.events.subscribe();
        Ok((snapshot, Watcher::new(prefix, rx)))
    }
}
