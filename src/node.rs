//! Node assembly.
//!
//! Wires the registry, group engine, router, and listeners described by a
//! [`Config`] into one running gateway node, and tears them down together.
//!
//! ```text
//! ClientGateway ──▶ ConnectionRegistry ──▶ Dispatcher ──▶ GroupManager
//!                                              │
//!                                              └──▶ ServiceRouter ──RPC──▶ backends
//! ```

use imgate_proto::{DiscoveryType, HandleRequest, RegisterRequest, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capability::ActionRouter;
use crate::config::{BackendBlock, Config, RouterMode};
use crate::discovery::{Announcer, Discovery, InstanceRecord, MemoryDiscovery};
use crate::error::{RouteError, StartupError};
use crate::handlers::Dispatcher;
use crate::network::{ClientGateway, GatewaySettings};
use crate::router::{RouteClient, RouteService, ServiceRouter};
use crate::rpc::{ClientPool, RpcServer};
use crate::services::{self, ServiceHost};
use crate::state::{ConnectionRegistry, GroupManager, InboundHandler, RegistrySettings};

/// How long startup waits for a hosted backend to appear in the route table.
const ANNOUNCE_SETTLE: Duration = Duration::from_secs(2);

/// The router a node dispatches forwarded actions through.
#[derive(Clone)]
pub enum RouterHandle {
    /// In-process router following discovery.
    Local(Arc<ServiceRouter>),
    /// Route node reached over RPC.
    Remote(Arc<RouteClient>),
}

impl RouterHandle {
    pub fn as_action_router(&self) -> Arc<dyn ActionRouter> {
        match self {
            Self::Local(router) => router.clone(),
            Self::Remote(client) => client.clone(),
        }
    }

    pub async fn register(&self, req: RegisterRequest) -> Result<(), RouteError> {
        match self {
            Self::Local(router) => router.register(req).await,
            Self::Remote(client) => client.register(&req).await,
        }
    }

    pub async fn deregister(&self, name: &str) -> Result<(), RouteError> {
        match self {
            Self::Local(router) => router.deregister(name).await.map(|_| ()),
            Self::Remote(client) => client.deregister(name).await,
        }
    }

    pub async fn route2(
        &self,
        action: &str,
        request: HandleRequest,
    ) -> Result<Response, RouteError> {
        self.as_action_router().route2(action, request).await
    }

    /// The local router, if this node runs one.
    pub fn local(&self) -> Option<&Arc<ServiceRouter>> {
        match self {
            Self::Local(router) => Some(router),
            Self::Remote(_) => None,
        }
    }
}

/// A hosted backend and where it listens.
#[derive(Debug, Clone)]
pub struct HostedBackend {
    pub name: String,
    pub id: String,
    pub addr: SocketAddr,
}

/// A running gateway node.
pub struct Node {
    registry: Arc<ConnectionRegistry>,
    groups: Arc<GroupManager>,
    router: RouterHandle,
    discovery: Arc<MemoryDiscovery>,
    dispatcher: Arc<Dispatcher>,
    client_addr: SocketAddr,
    rpc_addr: Option<SocketAddr>,
    backends: Vec<HostedBackend>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Build and start every component of `config`.
    ///
    /// Returns once all listeners are bound, static services are registered,
    /// and hosted backends are announced. On error every task started so far
    /// is cancelled.
    pub async fn start(config: &Config) -> Result<Self, StartupError> {
        let shutdown = CancellationToken::new();
        // stops whatever was already spawned if a later step fails
        let abort_on_error = shutdown.clone().drop_guard();
        let mut tasks = Vec::new();

        let discovery = Arc::new(MemoryDiscovery::new());
        tasks.push(
            discovery.spawn_reaper(config.discovery.reaper_interval(), shutdown.child_token()),
        );

        let groups = Arc::new(GroupManager::new());
        let registry = Arc::new(
            ConnectionRegistry::new(RegistrySettings {
                shards: config.limits.registry_shards,
                outbound_capacity: config.limits.outbound_capacity,
                overflow: config.limits.overflow_policy,
            })
            .with_observer(groups.clone()),
        );

        let pool = Arc::new(ClientPool::new(
            config.router.connect_timeout(),
            config.limits.max_frame_bytes,
        ));
        let router = match config.router.mode {
            RouterMode::Local => {
                let router = Arc::new(ServiceRouter::new(
                    discovery.clone(),
                    pool.clone(),
                    config.router.call_timeout(),
                ));
                tasks.push(router.start_watcher(shutdown.child_token()).await?);
                if let Some(interval) = config.router.health_interval() {
                    tasks.push(router.spawn_health_checker(interval, shutdown.child_token()));
                }
                RouterHandle::Local(router)
            }
            RouterMode::Remote => {
                let addr = config
                    .router
                    .remote_address
                    .clone()
                    .ok_or(StartupError::MissingRemoteRouter)?;
                info!(addr = %addr, "Using remote route node");
                RouterHandle::Remote(Arc::new(RouteClient::new(
                    addr,
                    pool.clone(),
                    config.router.call_timeout(),
                )))
            }
        };

        for service in &config.services {
            router.register(service.to_request()).await?;
            info!(service = %service.name, "Static service registered");
        }

        let mut backends = Vec::with_capacity(config.backends.len());
        for block in &config.backends {
            let (hosted, handles) =
                host_backend(config, block, &router, discovery.clone(), &shutdown).await?;
            tasks.extend(handles);
            backends.push(hosted);
        }

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            groups.clone(),
            router.as_action_router(),
            config.gateway.auth_action.clone(),
        ));
        let handler: Arc<dyn InboundHandler> = dispatcher.clone();
        registry.set_handler(Arc::downgrade(&handler));

        let gateway = ClientGateway::bind(
            config.listen.address,
            registry.clone(),
            GatewaySettings {
                max_frame_bytes: config.limits.max_frame_bytes,
            },
        )
        .await
        .map_err(|source| StartupError::Bind {
            what: "client gateway".to_string(),
            addr: config.listen.address,
            source,
        })?;
        let client_addr = local_addr(&gateway.local_addr(), config.listen.address);
        tasks.push(tokio::spawn(gateway.run(shutdown.child_token())));

        let rpc_addr = match (config.listen.rpc, router.local()) {
            (Some(addr), Some(local)) => {
                let service = Arc::new(RouteService::new(local.clone()));
                let server = RpcServer::bind("route", addr, service, config.limits.max_frame_bytes)
                    .await
                    .map_err(|source| StartupError::Bind {
                        what: "route rpc".to_string(),
                        addr,
                        source,
                    })?;
                let bound = local_addr(&server.local_addr(), addr);
                tasks.push(tokio::spawn(server.run(shutdown.child_token())));
                Some(bound)
            }
            (Some(addr), None) => {
                warn!(%addr, "listen.rpc ignored: this node uses a remote router");
                None
            }
            (None, _) => None,
        };

        if config.server.metrics_port != 0 {
            tasks.push(tokio::spawn(crate::http::run_http_server(
                config.server.metrics_port,
                shutdown.child_token(),
            )));
        } else {
            info!("Metrics endpoint disabled");
        }

        abort_on_error.disarm();
        info!(
            server = %config.server.name,
            node_id = %config.server.node_id,
            client = %client_addr,
            backends = backends.len(),
            "Node started"
        );

        Ok(Self {
            registry,
            groups,
            router,
            discovery,
            dispatcher,
            client_addr,
            rpc_addr,
            backends,
            shutdown,
            tasks,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }

    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    pub fn discovery(&self) -> &Arc<MemoryDiscovery> {
        &self.discovery
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bound client gateway address.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Bound route RPC address, when serving one.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_addr
    }

    pub fn backends(&self) -> &[HostedBackend] {
        &self.backends
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every listener and background task, then wait for them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "task failed during shutdown");
            }
        }
        info!("Node stopped");
    }
}

fn local_addr(bound: &std::io::Result<SocketAddr>, requested: SocketAddr) -> SocketAddr {
    bound.as_ref().copied().unwrap_or(requested)
}

/// Serve one built-in backend and make it routable.
///
/// With a local router the backend registers for coordinator discovery and
/// announces itself under a lease. With a remote router it registers its
/// bound address statically.
async fn host_backend(
    config: &Config,
    block: &BackendBlock,
    router: &RouterHandle,
    discovery: Arc<MemoryDiscovery>,
    shutdown: &CancellationToken,
) -> Result<(HostedBackend, Vec<JoinHandle<()>>), StartupError> {
    let handler =
        services::builtin(&block.handler, &block.name).ok_or_else(|| StartupError::UnknownHandler {
            name: block.name.clone(),
            handler: block.handler.clone(),
        })?;
    let server = RpcServer::bind(
        block.name.clone(),
        block.address,
        Arc::new(ServiceHost::new(handler)),
        config.limits.max_frame_bytes,
    )
    .await
    .map_err(|source| StartupError::Bind {
        what: format!("backend {}", block.name),
        addr: block.address,
        source,
    })?;
    let addr = local_addr(&server.local_addr(), block.address);
    let mut tasks = vec![tokio::spawn(server.run(shutdown.child_token()))];

    let id = block
        .id
        .clone()
        .unwrap_or_else(|| format!("{}-{}", block.name, config.server.node_id));
    let discovery_type = match router {
        RouterHandle::Local(_) => DiscoveryType::Coordinator,
        RouterHandle::Remote(_) => DiscoveryType::Static,
    };
    router
        .register(RegisterRequest {
            srv_id: block.name.clone(),
            srv_name: block.name.clone(),
            route_policy: block.policy,
            discovery_srv_url: match discovery_type {
                DiscoveryType::Coordinator => config.discovery.endpoints.clone(),
                DiscoveryType::Static => vec![addr.to_string()],
            },
            discovery_type,
            namespaces: block.namespaces.clone(),
        })
        .await?;

    if discovery_type == DiscoveryType::Coordinator {
        let discovery: Arc<dyn Discovery> = discovery;
        let record = InstanceRecord {
            id: id.clone(),
            service: block.name.clone(),
            addr: addr.to_string(),
        };
        let announcer = Announcer::new(discovery, record, config.discovery.lease_ttl());
        tasks.push(announcer.start(shutdown.child_token()).await?);
        if let RouterHandle::Local(local) = router
            && !local.wait_routable(&block.name, ANNOUNCE_SETTLE).await
        {
            warn!(service = %block.name, "backend announced but not yet routable");
        }
    }

    info!(service = %block.name, id = %id, %addr, "Backend hosted");
    Ok((
        HostedBackend {
            name: block.name.clone(),
            id,
            addr,
        },
        tasks,
    ))
}
