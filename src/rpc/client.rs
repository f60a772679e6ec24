//! RPC client and per-address client pool.

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use imgate_proto::{JsonCodec, RpcFault, RpcRequest, RpcResponse};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::dashmap_ext::DashMapExt;

/// Outgoing request queue depth per client.
const REQUEST_QUEUE: usize = 256;

/// RPC client errors.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("connection closed")]
    Closed,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Fault(#[from] RpcFault),

    #[error("codec: {0}")]
    Codec(String),
}

impl RpcError {
    /// Get a static error code string for metrics labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Closed => "closed",
            Self::Timeout(_) => "timeout",
            Self::Fault(f) => f.code.as_str(),
            Self::Codec(_) => "codec",
        }
    }
}

type Pending = DashMap<u64, oneshot::Sender<RpcResponse>>;

/// One multiplexed connection to an [`RpcServer`](crate::rpc::RpcServer).
pub struct RpcClient {
    addr: String,
    next_id: AtomicU64,
    pending: Arc<Pending>,
    tx: mpsc::Sender<RpcRequest>,
    closed: CancellationToken,
}

impl RpcClient {
    /// Connect within `connect_timeout`.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        max_frame: usize,
    ) -> Result<Self, RpcError> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RpcError::Connect {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(RpcError::Connect {
                    addr: addr.to_string(),
                    reason: format!("timed out after {connect_timeout:?}"),
                });
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<RpcRequest>(REQUEST_QUEUE);

        let mut writer =
            FramedWrite::new(write_half, JsonCodec::<RpcRequest>::with_max_len(max_frame));
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let req = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    req = rx.recv() => match req {
                        Some(req) => req,
                        None => break,
                    },
                };
                if let Err(e) = writer.send(req).await {
                    debug!(error = %e, "RPC client write failed");
                    break;
                }
            }
            writer_closed.cancel();
        });

        let mut reader =
            FramedRead::new(read_half, JsonCodec::<RpcResponse>::with_max_len(max_frame));
        let reader_closed = closed.clone();
        let reader_pending = Arc::clone(&pending);
        let peer = addr.to_string();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = reader.next() => frame,
                };
                match frame {
                    Some(Ok(resp)) => match reader_pending.remove(&resp.id) {
                        Some((_, slot)) => {
                            let _ = slot.send(resp);
                        }
                        // caller already timed out
                        None => debug!(id = resp.id, "late RPC response discarded"),
                    },
                    Some(Err(e)) => {
                        warn!(addr = %peer, error = %e, "RPC client decode failed");
                        break;
                    }
                    None => break,
                }
            }
            reader_closed.cancel();
            // dropping the senders fails every pending call with Closed
            reader_pending.clear();
        });

        Ok(Self {
            addr: addr.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            tx,
            closed,
        })
    }

    /// Remote address this client was connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the connection is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the connection, failing every pending call.
    pub fn close(&self) {
        self.closed.cancel();
        self.pending.clear();
    }

    /// Number of calls awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// One call with its own deadline.
    ///
    /// The deadline covers queueing the request as well as waiting for the
    /// response, so a peer that stops reading cannot stall callers.
    pub async fn call(
        &self,
        method: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, response) = oneshot::channel();
        self.pending.insert(id, slot);
        // the reader may have cleared pending between the check and the insert
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(RpcError::Closed);
        }

        let req = RpcRequest {
            id,
            method: method.to_string(),
            body,
        };
        let exchange = async {
            self.tx.send(req).await.map_err(|_| RpcError::Closed)?;
            response.await.map_err(|_| RpcError::Closed)
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(resp)) => resp.into_result().map_err(RpcError::Fault),
            Ok(Err(e)) => {
                self.pending.remove(&id);
                Err(e)
            }
            Err(_) => {
                self.pending.remove(&id);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// [`call`](Self::call) with typed body and result.
    pub async fn call_typed<B, R>(
        &self,
        method: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(|e| RpcError::Codec(e.to_string()))?;
        let value = self.call(method, body, timeout).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Codec(e.to_string()))
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// One [`RpcClient`] per address, reconnected on demand.
pub struct ClientPool {
    clients: DashMap<String, Arc<RpcClient>>,
    connect_timeout: Duration,
    max_frame: usize,
}

impl ClientPool {
    pub fn new(connect_timeout: Duration, max_frame: usize) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout,
            max_frame,
        }
    }

    /// A live client for `addr`, connecting if there is none.
    pub async fn get(&self, addr: &str) -> Result<Arc<RpcClient>, RpcError> {
        if let Some(client) = self.clients.get_cloned(addr)
            && !client.is_closed()
        {
            return Ok(client);
        }
        let client =
            Arc::new(RpcClient::connect(addr, self.connect_timeout, self.max_frame).await?);
        self.clients.insert(addr.to_string(), Arc::clone(&client));
        debug!(%addr, "RPC client connected");
        Ok(client)
    }

    /// Forget the client for `addr`.
    pub fn evict(&self, addr: &str) {
        if let Some((_, client)) = self.clients.remove(addr) {
            client.close();
        }
    }

    /// Number of pooled clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
