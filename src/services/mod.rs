//! Backend services hosted in-process.
//!
//! A backend implements [`ActionHandler`]; [`ServiceHost`] serves it over
//! RPC as the `Handle` method so routers reach in-process and remote
//! backends the same way.

mod echo;

pub use echo::EchoService;

use async_trait::async_trait;
use imgate_proto::rpc::method;
use imgate_proto::{FaultCode, HandleRequest, Response, Route2Request, RpcFault};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::rpc::RpcService;

/// Trait for backend services.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    /// Name of the service; also its routing namespace.
    fn name(&self) -> &str;

    /// Handle one forwarded request.
    async fn handle(&self, action: &str, request: HandleRequest) -> Result<Response, RpcFault>;
}

/// Serves an [`ActionHandler`] as an [`RpcService`].
pub struct ServiceHost {
    handler: Arc<dyn ActionHandler>,
}

impl ServiceHost {
    pub fn new(handler: Arc<dyn ActionHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl RpcService for ServiceHost {
    async fn call(&self, method: &str, body: Value) -> Result<Value, RpcFault> {
        if method != method::HANDLE {
            return Err(RpcFault::unknown_method(method));
        }
        let req: Route2Request = serde_json::from_value(body).map_err(RpcFault::bad_request)?;
        debug!(
            service = self.handler.name(),
            action = %req.action,
            uid = req.request.uid,
            "handle"
        );
        let resp = self.handler.handle(&req.action, req.request).await?;
        serde_json::to_value(resp).map_err(|e| RpcFault::new(FaultCode::Internal, e.to_string()))
    }
}

/// Build a built-in handler by kind.
pub fn builtin(kind: &str, name: &str) -> Option<Arc<dyn ActionHandler>> {
    match kind {
        "echo" => Some(Arc::new(EchoService::new(name))),
        _ => None,
    }
}
