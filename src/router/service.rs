//! The router exposed over RPC.

use async_trait::async_trait;
use imgate_proto::rpc::method;
use imgate_proto::{DeregisterRequest, RegisterRequest, Route2Request, RpcFault};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use super::ServiceRouter;
use crate::rpc::RpcService;

/// `Register`, `Deregister`, and `Route2` over RPC.
pub struct RouteService {
    router: Arc<ServiceRouter>,
}

impl RouteService {
    pub fn new(router: Arc<ServiceRouter>) -> Self {
        Self { router }
    }
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, RpcFault> {
    serde_json::from_value(body).map_err(RpcFault::bad_request)
}

#[async_trait]
impl RpcService for RouteService {
    async fn call(&self, method: &str, body: Value) -> Result<Value, RpcFault> {
        match method {
            method::REGISTER => {
                let req: RegisterRequest = decode(body)?;
                debug!(service = %req.srv_name, "remote register");
                self.router
                    .register(req)
                    .await
                    .map_err(|e| RpcFault::from(&e))?;
                Ok(json!({}))
            }
            method::DEREGISTER => {
                let req: DeregisterRequest = decode(body)?;
                let existed = self
                    .router
                    .deregister(&req.srv_name)
                    .await
                    .map_err(|e| RpcFault::from(&e))?;
                Ok(json!({ "removed": existed }))
            }
            method::ROUTE2 => {
                let req: Route2Request = decode(body)?;
                let resp = self
                    .router
                    .route2(&req.action, req.request)
                    .await
                    .map_err(|e| RpcFault::from(&e))?;
                serde_json::to_value(resp).map_err(|e| {
                    RpcFault::new(imgate_proto::FaultCode::Internal, e.to_string())
                })
            }
            other => Err(RpcFault::unknown_method(other)),
        }
    }
}
