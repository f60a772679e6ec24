//! Gateway - TCP listener that accepts client connections.
//!
//! Every accepted socket is registered with the connection registry and
//! served by its own task until either side closes it.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, instrument};

use super::connection;
use crate::state::ConnectionRegistry;
use crate::telemetry::spans;

/// Per-connection transport settings.
#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    /// Longest accepted frame.
    pub max_frame_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: imgate_proto::line::DEFAULT_MAX_LEN,
        }
    }
}

/// Accepts client connections.
pub struct ClientGateway {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    settings: GatewaySettings,
}

impl ClientGateway {
    /// Bind the gateway to `addr`.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        settings: GatewaySettings,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Client listener bound");
        Ok(Self {
            listener,
            registry,
            settings,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown`. Open connections are closed
    /// when it fires.
    #[instrument(skip_all, name = "gateway")]
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let registry = Arc::clone(&self.registry);
                        let settings = self.settings;
                        let shutdown = shutdown.clone();
                        let conn = connection::accept(&registry, addr);
                        let span = spans::connection(conn.id, &addr.to_string());
                        tokio::spawn(
                            connection::serve(stream, conn, registry, settings, shutdown)
                                .instrument(span),
                        );
                    }
                    Err(e) => error!(error = %e, "Failed to accept client connection"),
                }
            }
        }
        info!("Client listener stopped");
    }
}
