//! Lease-backed instance announcement.
//!
//! A backend instance writes its [`InstanceRecord`] under a lease and keeps
//! the lease alive at a third of its TTL. If the process dies the lease
//! lapses and watchers see the instance disappear.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Discovery, DiscoveryError, InstanceRecord, LeaseId, instance_key};

/// Keeps one instance registered in discovery.
pub struct Announcer {
    discovery: Arc<dyn Discovery>,
    record: InstanceRecord,
    ttl: Duration,
}

impl Announcer {
    pub fn new(discovery: Arc<dyn Discovery>, record: InstanceRecord, ttl: Duration) -> Self {
        Self {
            discovery,
            record,
            ttl,
        }
    }

    fn key(&self) -> String {
        instance_key(&self.record.service, &self.record.id)
    }

    /// Grant a lease and write the instance record under it.
    pub async fn announce(&self) -> Result<LeaseId, DiscoveryError> {
        let lease = self.discovery.grant_lease(self.ttl).await?;
        let value = serde_json::to_string(&self.record).map_err(|e| DiscoveryError::BadRecord {
            key: self.key(),
            reason: e.to_string(),
        })?;
        self.discovery.put(&self.key(), value, Some(lease)).await?;
        info!(
            service = %self.record.service,
            id = %self.record.id,
            addr = %self.record.addr,
            lease,
            "instance announced"
        );
        Ok(lease)
    }

    /// Announce, then keep the lease alive until `shutdown`, re-announcing
    /// if the lease is lost. Revokes the lease on exit.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.keep(None, shutdown)
    }

    /// Announce now, failing if the store refuses, then keep the lease
    /// alive in the background like [`spawn`](Self::spawn).
    pub async fn start(
        self,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, DiscoveryError> {
        let lease = self.announce().await?;
        Ok(self.keep(Some(lease), shutdown))
    }

    fn keep(self, initial: Option<LeaseId>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = (self.ttl / 3).max(Duration::from_millis(50));
            let mut ticker = tokio::time::interval(period);
            let mut lease = initial;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                lease = match lease {
                    Some(id) => match self.discovery.keep_alive(id).await {
                        Ok(()) => Some(id),
                        Err(e) => {
                            warn!(
                                service = %self.record.service,
                                error = %e,
                                "lease lost, re-announcing"
                            );
                            self.announce().await.ok()
                        }
                    },
                    None => match self.announce().await {
                        Ok(id) => Some(id),
                        Err(e) => {
                            warn!(service = %self.record.service, error = %e, "announce failed");
                            None
                        }
                    },
                };
            }
            if let Some(id) = lease {
                let _ = self.discovery.revoke(id).await;
                info!(service = %self.record.service, id = %self.record.id, "instance withdrawn");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDiscovery;

    fn record() -> InstanceRecord {
        InstanceRecord {
            id: "api-1".into(),
            service: "api".into(),
            addr: "127.0.0.1:7001".into(),
        }
    }

    #[tokio::test]
    async fn announce_writes_record() {
        let store = Arc::new(MemoryDiscovery::new());
        let announcer = Announcer::new(store.clone(), record(), Duration::from_secs(3));
        announcer.announce().await.unwrap();

        let entries = store.list("/services/api/").await.unwrap();
        assert_eq!(entries.len(), 1);
        let decoded: InstanceRecord = serde_json::from_str(&entries[0].1).unwrap();
        assert_eq!(decoded, record());
    }

    #[tokio::test]
    async fn shutdown_revokes_lease() {
        let store = Arc::new(MemoryDiscovery::new());
        let shutdown = CancellationToken::new();
        let (_, mut watcher) = store.watch("/services/").await.unwrap();
        let handle = Announcer::new(store.clone(), record(), Duration::from_secs(3))
            .spawn(shutdown.clone());

        // first tick fires immediately
        let ev = watcher.recv().await.unwrap();
        assert_eq!(ev.key, "/services/api/api-1");

        shutdown.cancel();
        handle.await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn start_announces_before_returning() {
        let store = Arc::new(MemoryDiscovery::new());
        let shutdown = CancellationToken::new();
        let handle = Announcer::new(store.clone(), record(), Duration::from_secs(3))
            .start(shutdown.clone())
            .await
            .unwrap();
        assert_eq!(store.list("/services/api/").await.unwrap().len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
        assert!(store.is_empty());
    }
}
