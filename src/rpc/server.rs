//! RPC server.
//!
//! Each accepted connection gets a reader loop and a writer task. Requests
//! are handled concurrently (one task per request) and answered in
//! completion order. `Ping` is answered by the server itself.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use imgate_proto::rpc::method;
use imgate_proto::{JsonCodec, RpcFault, RpcRequest, RpcResponse};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Per-connection response queue depth.
const RESPONSE_QUEUE: usize = 256;

/// A service reachable over RPC.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle one call.
    async fn call(&self, method: &str, body: Value) -> Result<Value, RpcFault>;
}

/// TCP listener serving one [`RpcService`].
pub struct RpcServer {
    name: String,
    listener: TcpListener,
    service: Arc<dyn RpcService>,
    max_frame: usize,
}

impl RpcServer {
    /// Bind to `addr`. Port 0 picks a free port, see [`local_addr`](Self::local_addr).
    pub async fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        service: Arc<dyn RpcService>,
        max_frame: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let name = name.into();
        info!(name = %name, addr = %listener.local_addr()?, "RPC listener bound");
        Ok(Self {
            name,
            listener,
            service,
            max_frame,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown`.
    #[instrument(skip_all, name = "rpc_server", fields(name = %self.name))]
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "RPC peer connected");
                        let service = Arc::clone(&self.service);
                        let shutdown = shutdown.child_token();
                        let max_frame = self.max_frame;
                        tokio::spawn(async move {
                            serve_connection(stream, service, shutdown, max_frame).await;
                            debug!(%peer, "RPC peer disconnected");
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept RPC connection"),
                }
            }
        }
        info!("RPC listener stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    service: Arc<dyn RpcService>,
    shutdown: CancellationToken,
    max_frame: usize,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<RpcRequest>::with_max_len(max_frame));
    let mut writer =
        FramedWrite::new(write_half, JsonCodec::<RpcResponse>::with_max_len(max_frame));
    let (tx, mut rx) = mpsc::channel::<RpcResponse>(RESPONSE_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            if let Err(e) = writer.send(resp).await {
                debug!(error = %e, "RPC write failed");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(req)) => {
                let service = Arc::clone(&service);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let id = req.id;
                    let result = if req.method == method::PING {
                        Ok(json!("pong"))
                    } else {
                        service.call(&req.method, req.body).await
                    };
                    let resp = match result {
                        Ok(value) => RpcResponse::ok(id, value),
                        Err(fault) => RpcResponse::fault(id, fault),
                    };
                    let _ = tx.send(resp).await;
                });
            }
            Some(Err(e)) => {
                warn!(error = %e, "Malformed RPC frame, closing connection");
                let _ = tx.send(RpcResponse::fault(0, RpcFault::bad_request(&e))).await;
                break;
            }
            None => break,
        }
    }

    drop(tx);
    // in-flight handlers hold sender clones; the writer drains until they finish
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcClient;
    use std::time::Duration;

    struct Upper;

    #[async_trait]
    impl RpcService for Upper {
        async fn call(&self, method: &str, body: Value) -> Result<Value, RpcFault> {
            match method {
                "Upper" => Ok(json!(body.as_str().unwrap_or_default().to_uppercase())),
                "Slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(Value::Null)
                }
                other => Err(RpcFault::unknown_method(other)),
            }
        }
    }

    async fn start() -> (SocketAddr, CancellationToken) {
        let listen = "127.0.0.1:0".parse().unwrap();
        let server = RpcServer::bind("test", listen, Arc::new(Upper), 1 << 20)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn call_ping_and_unknown_method() {
        let (addr, shutdown) = start().await;
        let client = RpcClient::connect(&addr.to_string(), Duration::from_secs(1), 1 << 20)
            .await
            .unwrap();
        let timeout = Duration::from_secs(1);

        assert_eq!(client.call("Upper", json!("abc"), timeout).await.unwrap(), json!("ABC"));
        assert_eq!(client.call(method::PING, Value::Null, timeout).await.unwrap(), json!("pong"));
        let err = client.call("Nope", Value::Null, timeout).await.unwrap_err();
        assert!(matches!(
            err,
            crate::rpc::RpcError::Fault(f) if f.code == imgate_proto::FaultCode::UnknownMethod
        ));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn concurrent_calls_are_multiplexed() {
        let (addr, shutdown) = start().await;
        let client = Arc::new(
            RpcClient::connect(&addr.to_string(), Duration::from_secs(1), 1 << 20)
                .await
                .unwrap(),
        );
        let slow = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client.call("Slow", Value::Null, Duration::from_secs(2)).await
            })
        };
        // answered while Slow is still in flight
        let fast = client.call("Upper", json!("x"), Duration::from_millis(150)).await;
        assert_eq!(fast.unwrap(), json!("X"));
        assert!(slow.await.unwrap().is_ok());
        shutdown.cancel();
    }
}
