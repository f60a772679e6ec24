//! `session.signin` and `session.logout`.
//!
//! The gateway does not authenticate anyone itself. Sign-in is forwarded to
//! the auth backend; a reply whose data carries `{uid, device}` is the grant,
//! anything else is relayed to the client unchanged.

use imgate_proto::{DeviceId, HandleRequest, Message, Uid};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::reply;
use crate::capability::{ActionRouter, ClientManager};
use crate::error::{DispatchError, DispatchResult};
use crate::state::is_temporary;

#[derive(Deserialize)]
struct Grant {
    uid: Uid,
    device: DeviceId,
}

pub(super) async fn sign_in(
    clients: &dyn ClientManager,
    router: &dyn ActionRouter,
    auth_action: &str,
    from: Uid,
    device: DeviceId,
    msg: Message,
) -> DispatchResult {
    let seq = msg.seq;
    let action = msg.action.clone();

    let mut forwarded = msg;
    forwarded.action = auth_action.to_string();
    let request = HandleRequest {
        uid: from,
        device,
        message: forwarded,
    };
    let resp = router.route2(auth_action, request).await?;
    let data = resp.message.data;

    match Grant::deserialize(&data) {
        Ok(grant) if grant.uid > 0 && !is_temporary(grant.uid) => {
            // a bound connection keeps its device slot; the registry finds it by (from, device)
            if !is_temporary(from) && grant.device != device {
                return Err(DispatchError::DeviceMismatch {
                    device,
                    granted: grant.device,
                });
            }
            clients.client_sign_in(from, grant.uid, grant.device)?;
            info!(conn = from, uid = grant.uid, device = grant.device, "signed in");
        }
        _ => debug!(conn = from, "sign-in refused by auth backend"),
    }
    Ok(Some(Message::new(action, data).with_seq(seq).stamped()))
}

pub(super) fn logout(clients: &dyn ClientManager, from: Uid, msg: &Message) -> DispatchResult {
    let devices = clients.user_logout(from);
    info!(uid = from, devices, "logged out");
    reply(msg, json!({ "devices": devices }))
}
