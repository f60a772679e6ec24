//! Actions owned by backend services.

use imgate_proto::{DeviceId, HandleRequest, Message, Uid};

use crate::capability::ActionRouter;
use crate::error::DispatchResult;

/// Route `msg` and hand the backend's reply back to the caller.
///
/// The reply carries the request's `seq`; an empty reply action is
/// replaced by the request's.
pub(super) async fn handle(
    router: &dyn ActionRouter,
    from: Uid,
    device: DeviceId,
    msg: Message,
) -> DispatchResult {
    let seq = msg.seq;
    let action = msg.action.clone();
    let request = HandleRequest {
        uid: from,
        device,
        message: msg,
    };
    let mut reply = router.route2(&action, request).await?.message;
    reply.seq = seq;
    if reply.action.is_empty() {
        reply.action = action;
    }
    Ok(Some(reply))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{DEFAULT_AUTH_ACTION, Dispatcher};
    use imgate_proto::{Message, Response};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn forwards_with_caller_identity() {
        let router = FnRouter::new(|action, req| {
            assert_eq!(action, "api.app.echo");
            assert_eq!((req.uid, req.device), (5, 2));
            assert_eq!(req.message.from, 5);
            Ok(Response {
                message: Message::new("", req.message.data.clone()),
            })
        });
        let d = Dispatcher::new(
            Arc::new(CountingClients::default()),
            Arc::new(RecordingGroups::default()),
            Arc::new(router),
            DEFAULT_AUTH_ACTION,
        );
        let reply = d
            .dispatch(5, 2, Message::new("api.app.echo", json!({"x": 1})).with_seq(41))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.seq, 41);
        assert_eq!(reply.action, "api.app.echo");
        assert_eq!(reply.data, json!({"x": 1}));
    }
}
