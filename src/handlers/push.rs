//! `push.send` and `push.send_if_online`.

use imgate_proto::{DeviceId, Message, Uid};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{payload, reply};
use crate::capability::{ClientManager, send_message, send_message_if_online};
use crate::error::DispatchResult;

#[derive(Deserialize)]
struct Push {
    uid: Uid,
    #[serde(default)]
    device: DeviceId,
    action: String,
    #[serde(default)]
    data: Value,
}

pub(super) fn handle(
    clients: &dyn ClientManager,
    only_if_online: bool,
    msg: &Message,
) -> DispatchResult {
    let req: Push = payload(msg)?;
    let out = Arc::new(Message::new(req.action, req.data).with_sender(msg.from).stamped());
    let queued = if only_if_online {
        send_message_if_online(clients, req.uid, req.device, out)
    } else {
        send_message(clients, req.uid, req.device, out).is_queued()
    };
    reply(msg, json!({ "queued": queued }))
}
