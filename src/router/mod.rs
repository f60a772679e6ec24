//! Service router.
//!
//! Resolves an action to the service claiming its longest prefix, picks one
//! healthy instance under the service's policy, and performs a single
//! `Handle` RPC with a deadline. The route table is an immutable snapshot in
//! an [`ArcSwap`]: lookups never block, and every change publishes a new
//! snapshot.
//!
//! # Sources of truth
//!
//! Registrations are written to discovery under `/routes/{name}` before
//! being applied locally, so every router following discovery converges on
//! the same table. Coordinator-discovered instances come from
//! `/services/{name}/{id}` leases; losing a lease removes the instance.

pub mod policy;
pub mod remote;
pub mod service;
pub mod table;

pub use remote::RouteClient;
pub use service::RouteService;
pub use table::{Instance, InstanceSet, RouteEntry, RouteTable, Selected};

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use imgate_proto::rpc::method;
use imgate_proto::{HandleRequest, RegisterRequest, Response, Route2Request};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::discovery::{
    Discovery, InstanceRecord, ROUTES_PREFIX, SERVICES_PREFIX, WatchError, WatchEvent,
    WatchEventKind, Watcher, parse_instance_key, parse_route_key, route_key,
};
use crate::error::RouteError;
use crate::rpc::{ClientPool, RpcError};
use crate::telemetry::spans;

/// Default deadline for one routed call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(3000);

/// Routes actions to backend service instances.
pub struct ServiceRouter {
    table: ArcSwap<RouteTable>,
    discovery: Arc<dyn Discovery>,
    pool: Arc<ClientPool>,
    call_timeout: Duration,
}

impl ServiceRouter {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        pool: Arc<ClientPool>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::new()),
            discovery,
            pool,
            call_timeout,
        }
    }

    /// Current route table snapshot.
    pub fn table(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Apply `f` copy-on-write. `f` returns `None` for "no change" and may
    /// run more than once under contention.
    fn update<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&RouteTable) -> Option<RouteTable>,
    {
        let mut changed = false;
        self.table.rcu(|current| match f(current) {
            Some(next) => {
                changed = true;
                Arc::new(next)
            }
            None => {
                changed = false;
                Arc::clone(current)
            }
        });
        if changed {
            crate::metrics::set_route_table_version(self.table.load().version());
        }
        changed
    }

    /// Publish a registration to discovery and apply it locally.
    pub async fn register(&self, req: RegisterRequest) -> Result<(), RouteError> {
        if !imgate_proto::action::is_valid(&req.srv_name)
            || req.namespaces.iter().any(|ns| !imgate_proto::action::is_valid(ns))
        {
            return Err(RouteError::InvalidAction(req.srv_name));
        }
        let value = serde_json::to_string(&req).map_err(|e| {
            RouteError::Discovery(crate::discovery::DiscoveryError::BadRecord {
                key: route_key(&req.srv_name),
                reason: e.to_string(),
            })
        })?;
        self.discovery.put(&route_key(&req.srv_name), value, None).await?;
        self.apply_register(&req);
        Ok(())
    }

    fn apply_register(&self, req: &RegisterRequest) {
        self.update(|t| Some(t.with_service(RouteEntry::from_request(req))));
        info!(
            service = %req.srv_name,
            policy = ?req.route_policy,
            discovery = ?req.discovery_type,
            "service registered"
        );
    }

    /// Remove a registration. Returns whether it existed anywhere.
    pub async fn deregister(&self, name: &str) -> Result<bool, RouteError> {
        let published = self.discovery.delete(&route_key(name)).await?;
        let local = self.apply_deregister(name);
        Ok(published || local)
    }

    fn apply_deregister(&self, name: &str) -> bool {
        let removed = self.update(|t| t.without_service(name));
        if removed {
            info!(service = %name, "service deregistered");
        }
        removed
    }

    /// Route one request to the service claiming `action`.
    ///
    /// Exactly one attempt; a failure is reported, never retried.
    pub async fn route2(
        &self,
        action: &str,
        request: HandleRequest,
    ) -> Result<Response, RouteError> {
        let selected = self.table.load().select(action, request.uid)?;
        let service = selected.service.service_name.clone();
        let addr = selected.instance.addr.clone();
        let span = spans::route(action, &service, &selected.instance.id);

        let result = async {
            let client = self
                .pool
                .get(&addr)
                .await
                .map_err(|e| self.map_rpc_error(&service, &addr, e))?;
            let body = Route2Request {
                action: action.to_string(),
                request,
            };
            client
                .call_typed::<_, Response>(method::HANDLE, &body, self.call_timeout)
                .await
                .map_err(|e| self.map_rpc_error(&service, &addr, e))
        }
        .instrument(span)
        .await;

        let label = match &result {
            Ok(_) => "ok",
            Err(e) => e.error_code(),
        };
        crate::metrics::record_route_call(&service, label);
        result
    }

    fn map_rpc_error(&self, service: &str, addr: &str, err: RpcError) -> RouteError {
        match err {
            RpcError::Connect { .. } | RpcError::Closed => {
                debug!(service, addr, error = %err, "instance unreachable");
                self.pool.evict(addr);
                RouteError::RouteUnavailable(service.to_string())
            }
            RpcError::Timeout(after) => RouteError::Timeout {
                service: service.to_string(),
                after,
            },
            RpcError::Fault(fault) => RouteError::from(fault),
            RpcError::Codec(reason) => RouteError::Remote(imgate_proto::RpcFault::new(
                imgate_proto::FaultCode::Internal,
                reason,
            )),
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Rebuild the table from discovery snapshots.
    fn apply_snapshot(&self, routes: Vec<(String, String)>, instances: Vec<(String, String)>) {
        let registrations: Vec<RegisterRequest> = routes
            .into_iter()
            .filter_map(|(key, value)| parse_registration(&key, &value))
            .collect();
        let mut discovered: HashMap<String, Vec<Instance>> = HashMap::new();
        for (key, value) in instances {
            if let Some((service, instance)) = parse_instance(&key, &value) {
                discovered.entry(service).or_default().push(instance);
            }
        }

        self.update(|current| {
            let mut next = current.clone();
            for name in current.service_names() {
                if !registrations.iter().any(|r| r.srv_name == name)
                    && let Some(t) = next.without_service(&name)
                {
                    next = t;
                }
            }
            for req in &registrations {
                next = next.with_service(RouteEntry::from_request(req));
            }
            Some(next.with_discovered(discovered.clone()))
        });
        let table = self.table.load();
        info!(
            services = table.service_names().len(),
            instances = table.all_instances().len(),
            version = table.version(),
            "route table synchronised"
        );
    }

    fn apply_event(&self, event: WatchEvent) {
        if let Some(name) = parse_route_key(&event.key) {
            match event.kind {
                WatchEventKind::Put { value } => {
                    if let Some(req) = parse_registration(&event.key, &value) {
                        self.apply_register(&req);
                    }
                    crate::metrics::record_discovery_event("routes", "put");
                }
                WatchEventKind::Delete => {
                    self.apply_deregister(name);
                    crate::metrics::record_discovery_event("routes", "delete");
                }
            }
        } else if let Some((service, id)) = parse_instance_key(&event.key) {
            match event.kind {
                WatchEventKind::Put { value } => {
                    if let Some((service, instance)) = parse_instance(&event.key, &value) {
                        info!(
                            %service,
                            instance = %instance.id,
                            addr = %instance.addr,
                            "instance up"
                        );
                        self.update(|t| Some(t.with_instance(&service, instance.clone())));
                    }
                    crate::metrics::record_discovery_event("services", "put");
                }
                WatchEventKind::Delete => {
                    if self.update(|t| t.without_instance(service, id)) {
                        info!(%service, instance = %id, "instance gone");
                    }
                    crate::metrics::record_discovery_event("services", "delete");
                }
            }
        }
    }

    async fn watch_all(&self) -> Result<(Watcher, Watcher), RouteError> {
        let (routes, route_watch) = self.discovery.watch(ROUTES_PREFIX).await?;
        let (instances, instance_watch) = self.discovery.watch(SERVICES_PREFIX).await?;
        self.apply_snapshot(routes, instances);
        Ok((route_watch, instance_watch))
    }

    /// Synchronise from discovery, then follow changes until `shutdown`.
    ///
    /// The initial sync completes before this returns. A lagged watch
    /// resubscribes and resynchronises from a fresh snapshot.
    pub async fn start_watcher(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, RouteError> {
        let (mut routes, mut instances) = self.watch_all().await?;
        let router = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    ev = routes.recv() => ev,
                    ev = instances.recv() => ev,
                };
                match next {
                    Ok(event) => router.apply_event(event),
                    Err(WatchError::Lagged(missed)) => {
                        warn!(missed, "discovery watch lagged, resynchronising");
                        match router.watch_all().await {
                            Ok((r, i)) => {
                                routes = r;
                                instances = i;
                            }
                            Err(e) => {
                                warn!(error = %e, "resync failed, stopping watcher");
                                break;
                            }
                        }
                    }
                    Err(WatchError::Closed) => {
                        warn!("discovery watch closed");
                        break;
                    }
                }
            }
            debug!("route watcher stopped");
        }))
    }

    /// Wait until `service` has a healthy instance, for at most `within`.
    pub async fn wait_routable(&self, service: &str, within: Duration) -> bool {
        let routable = || {
            self.table
                .load()
                .instances(service)
                .is_some_and(|set| set.healthy_count() > 0)
        };
        let deadline = tokio::time::Instant::now() + within;
        while !routable() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Ping every known instance once and update health flags.
    /// Returns how many instances changed state.
    pub async fn check_health(&self) -> usize {
        let instances = self.table.load().all_instances();
        let checks = instances.into_iter().map(|(service, instance)| async move {
            let healthy = self.ping(&instance.addr).await;
            (service, instance, healthy)
        });
        let mut changed = 0;
        for (service, instance, healthy) in join_all(checks).await {
            if !healthy {
                self.pool.evict(&instance.addr);
            }
            if self.update(|t| t.with_health(&service, &instance.id, healthy)) {
                changed += 1;
                if healthy {
                    info!(%service, instance = %instance.id, "instance healthy again");
                } else {
                    warn!(
                        %service,
                        instance = %instance.id,
                        addr = %instance.addr,
                        "instance failed health check"
                    );
                }
            }
        }
        changed
    }

    async fn ping(&self, addr: &str) -> bool {
        match self.pool.get(addr).await {
            Ok(client) => client
                .call(method::PING, Value::Null, self.call_timeout)
                .await
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Spawn a task that runs [`check_health`](Self::check_health) every `interval`.
    pub fn spawn_health_checker(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        router.check_health().await;
                    }
                }
            }
            debug!("health checker stopped");
        })
    }
}

fn parse_registration(key: &str, value: &str) -> Option<RegisterRequest> {
    match serde_json::from_str::<RegisterRequest>(value) {
        Ok(req) if parse_route_key(key) == Some(req.srv_name.as_str()) => Some(req),
        Ok(req) => {
            warn!(key, service = %req.srv_name, "registration key and name disagree, ignored");
            None
        }
        Err(e) => {
            warn!(key, error = %e, "unparseable registration ignored");
            None
        }
    }
}

fn parse_instance(key: &str, value: &str) -> Option<(String, Instance)> {
    let (service, id) = parse_instance_key(key)?;
    match serde_json::from_str::<InstanceRecord>(value) {
        Ok(record) => Some((service.to_string(), Instance::new(id, record.addr))),
        Err(e) => {
            warn!(key, error = %e, "unparseable instance record ignored");
            None
        }
    }
}
