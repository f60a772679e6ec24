//! Client side of a standalone route node.

use async_trait::async_trait;
use imgate_proto::rpc::method;
use imgate_proto::{
    DeregisterRequest, FaultCode, HandleRequest, RegisterRequest, Response, Route2Request, RpcFault,
};
use std::sync::Arc;
use std::time::Duration;

use crate::capability::ActionRouter;
use crate::error::RouteError;
use crate::rpc::{ClientPool, RpcError};

/// Reaches a [`RouteService`](super::RouteService) on another node.
pub struct RouteClient {
    addr: String,
    pool: Arc<ClientPool>,
    call_timeout: Duration,
}

impl RouteClient {
    pub fn new(addr: impl Into<String>, pool: Arc<ClientPool>, call_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            pool,
            call_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn map_error(&self, err: RpcError) -> RouteError {
        match err {
            RpcError::Connect { .. } | RpcError::Closed => {
                self.pool.evict(&self.addr);
                RouteError::RouteUnavailable("route".to_string())
            }
            RpcError::Timeout(after) => RouteError::Timeout {
                service: "route".to_string(),
                after,
            },
            RpcError::Fault(fault) => RouteError::from(fault),
            RpcError::Codec(reason) => {
                RouteError::Remote(RpcFault::new(FaultCode::Internal, reason))
            }
        }
    }

    async fn call<B, R>(&self, method: &str, body: &B, timeout: Duration) -> Result<R, RouteError>
    where
        B: serde::Serialize + Sync,
        R: serde::de::DeserializeOwned,
    {
        let client = self.pool.get(&self.addr).await.map_err(|e| self.map_error(e))?;
        client
            .call_typed(method, body, timeout)
            .await
            .map_err(|e| self.map_error(e))
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<(), RouteError> {
        let _: serde_json::Value = self.call(method::REGISTER, req, self.call_timeout).await?;
        Ok(())
    }

    pub async fn deregister(&self, name: &str) -> Result<(), RouteError> {
        let req = DeregisterRequest {
            srv_name: name.to_string(),
        };
        let _: serde_json::Value = self.call(method::DEREGISTER, &req, self.call_timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl ActionRouter for RouteClient {
    async fn route2(&self, action: &str, request: HandleRequest) -> Result<Response, RouteError> {
        let body = Route2Request {
            action: action.to_string(),
            request,
        };
        // the route node applies its own call deadline; leave it room to answer
        self.call(method::ROUTE2, &body, self.call_timeout * 2).await
    }
}
