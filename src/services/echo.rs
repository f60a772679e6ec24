//! Echo backend.
//!
//! Answers every action with the request data. Under `{name}.auth.signin`
//! it grants the uid and device named in the request, trusting the client,
//! which makes it a development auth backend.

use async_trait::async_trait;
use imgate_proto::{DeviceId, HandleRequest, Response, RpcFault, Uid};
use serde::Deserialize;
use serde_json::json;

use super::ActionHandler;

pub struct EchoService {
    name: String,
    signin_action: String,
}

impl EchoService {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            signin_action: format!("{name}.auth.signin"),
            name,
        }
    }
}

#[derive(Deserialize)]
struct SignIn {
    uid: Uid,
    #[serde(default)]
    device: DeviceId,
}

#[async_trait]
impl ActionHandler for EchoService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, action: &str, request: HandleRequest) -> Result<Response, RpcFault> {
        let msg = &request.message;
        let data = if action == self.signin_action {
            let req = SignIn::deserialize(&msg.data).map_err(RpcFault::bad_request)?;
            json!({ "uid": req.uid, "device": req.device })
        } else {
            msg.data.clone()
        };
        Ok(Response {
            message: msg.reply(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgate_proto::{FaultCode, Message};

    #[tokio::test]
    async fn echoes_data_and_seq() {
        let svc = EchoService::new("api");
        let msg = Message::new("api.app.echo", json!({"k": [1, 2]})).with_seq(3);
        let req = HandleRequest::new(1, msg);
        let resp = svc.handle("api.app.echo", req).await.unwrap();
        assert_eq!(resp.message.seq, 3);
        assert_eq!(resp.message.action, "api.app.echo");
        assert_eq!(resp.message.data, json!({"k": [1, 2]}));
    }

    #[tokio::test]
    async fn signin_grants_requested_identity() {
        let svc = EchoService::new("api");
        let msg = Message::new("api.auth.signin", json!({"uid": 7, "device": 2}));
        let req = HandleRequest::new(1 << 48, msg);
        let resp = svc.handle("api.auth.signin", req).await.unwrap();
        assert_eq!(resp.message.data, json!({"uid": 7, "device": 2}));

        let req = HandleRequest::new(1 << 48, Message::new("api.auth.signin", json!({})));
        let err = svc.handle("api.auth.signin", req).await.unwrap_err();
        assert_eq!(err.code, FaultCode::BadRequest);
    }
}
