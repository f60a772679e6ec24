//! `group.*` actions.

use imgate_proto::{Gid, Message, Uid};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, info};

use super::{GroupAction, payload, reply};
use crate::capability::GroupApi;
use crate::error::DispatchResult;
use crate::state::{BatchReport, MemberFlags, NotifyOutcome};
use crate::telemetry::spans;

#[derive(Deserialize)]
struct CreateGroup {
    gid: Gid,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct GroupRef {
    gid: Gid,
}

#[derive(Deserialize)]
struct MuteGroup {
    gid: Gid,
    #[serde(default = "default_true")]
    mute: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct PutMembers {
    gid: Gid,
    /// `uid → flags`; JSON object keys are decimal uids.
    members: HashMap<Uid, MemberFlags>,
}

#[derive(Deserialize)]
struct RemoveMembers {
    gid: Gid,
    uids: Vec<Uid>,
}

#[derive(Deserialize)]
struct Presence {
    gid: Gid,
    /// Defaults to the caller.
    uid: Option<Uid>,
}

#[derive(Deserialize)]
struct Notify {
    gid: Gid,
    action: String,
    #[serde(default)]
    data: Value,
}

fn report(report: &BatchReport) -> Value {
    let skipped: Vec<usize> = report.skipped.iter().map(|(idx, _)| *idx).collect();
    json!({ "applied": report.applied, "skipped": skipped })
}

pub(super) fn handle(groups: &dyn GroupApi, action: GroupAction, msg: &Message) -> DispatchResult {
    let from = msg.from;
    match action {
        GroupAction::Create => {
            let req: CreateGroup = payload(msg)?;
            groups.create_group(req.gid, req.name, from)?;
            info!(gid = req.gid, owner = from, "group created");
            reply(msg, json!({ "gid": req.gid }))
        }
        GroupAction::Dissolve => {
            let req: GroupRef = payload(msg)?;
            groups.dissolve_group(req.gid)?;
            info!(gid = req.gid, by = from, "group dissolved");
            reply(msg, json!({ "gid": req.gid }))
        }
        GroupAction::Mute => {
            let req: MuteGroup = payload(msg)?;
            groups.mute_group(req.gid, req.mute)?;
            reply(msg, json!({ "gid": req.gid, "muted": req.mute }))
        }
        GroupAction::MemberPut => {
            let req: PutMembers = payload(msg)?;
            let mut members: Vec<_> = req.members.into_iter().collect();
            members.sort_unstable_by_key(|(uid, _)| *uid);
            let r = groups.put_member(req.gid, members)?;
            reply(msg, report(&r))
        }
        GroupAction::MemberRemove => {
            let req: RemoveMembers = payload(msg)?;
            let r = groups.remove_member(req.gid, req.uids)?;
            reply(msg, report(&r))
        }
        GroupAction::MemberOnline => {
            let req: Presence = payload(msg)?;
            let r = groups.member_online(req.gid, req.uid.unwrap_or(from))?;
            reply(msg, report(&r))
        }
        GroupAction::MemberOffline => {
            let req: Presence = payload(msg)?;
            let r = groups.member_offline(req.gid, req.uid.unwrap_or(from))?;
            reply(msg, report(&r))
        }
        GroupAction::Notify => {
            let req: Notify = payload(msg)?;
            let notice = Arc::new(Message::new(req.action, req.data).with_sender(from).stamped());
            let outcome = spans::fanout(req.gid, from)
                .in_scope(|| groups.dispatch_notify_message(req.gid, notice))?;
            let data = match outcome {
                NotifyOutcome::Delivered { recipients } => json!({ "delivered": recipients }),
                NotifyOutcome::Suppressed => json!({ "delivered": 0, "suppressed": true }),
            };
            reply(msg, data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{DEFAULT_AUTH_ACTION, Dispatcher};
    use crate::error::DispatchError;
    use crate::state::{OverflowPolicy, Outbound, PresenceObserver};
    use imgate_proto::Message;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (Dispatcher, Arc<RecordingGroups>) {
        let groups = Arc::new(RecordingGroups::default());
        let d = Dispatcher::new(
            Arc::new(CountingClients::default()),
            Arc::clone(&groups) as _,
            no_routes(),
            DEFAULT_AUTH_ACTION,
        );
        (d, groups)
    }

    #[tokio::test]
    async fn create_put_notify_flow() {
        let (d, groups) = setup();
        d.dispatch(1, 0, Message::new("group.create", json!({"gid": 10, "name": "g"})))
            .await
            .unwrap();
        assert_eq!(groups.inner.group_info(10).unwrap().owner, 1);

        let reply = d
            .dispatch(
                1,
                0,
                Message::new(
                    "group.member.put",
                    json!({"gid": 10, "members": {"1": 1, "2": 0, "3": 0}}),
                ),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data["applied"], 3);
        assert_eq!(*groups.batches.lock(), vec![(10, 3)]);

        // uid 2 comes online on device 5
        let (out, mut rx) = Outbound::channel(2, 8, CancellationToken::new(), OverflowPolicy::Drop);
        groups.inner.on_device_online(2, 5, &out);

        let reply = d
            .dispatch(
                1,
                0,
                Message::new(
                    "group.notify",
                    json!({"gid": 10, "action": "im.group.text", "data": "hi"}),
                ),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data["delivered"], 1);
        let got = rx.try_recv().unwrap();
        assert_eq!(got.action, "im.group.text");
        assert_eq!(got.from, 1);
    }

    #[tokio::test]
    async fn muted_group_suppresses_non_admin() {
        let (d, _groups) = setup();
        d.dispatch(1, 0, Message::new("group.create", json!({"gid": 3})))
            .await
            .unwrap();
        d.dispatch(1, 0, Message::new("group.member.put", json!({"gid": 3, "members": {"4": 0}})))
            .await
            .unwrap();
        d.dispatch(1, 0, Message::new("group.mute", json!({"gid": 3, "mute": true})))
            .await
            .unwrap();

        let reply = d
            .dispatch(4, 0, Message::new("group.notify", json!({"gid": 3, "action": "x.y"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data["suppressed"], true);

        // the owner still gets through
        let reply = d
            .dispatch(1, 0, Message::new("group.notify", json!({"gid": 3, "action": "x.y"})))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.data.get("suppressed").is_none());
    }

    #[tokio::test]
    async fn unknown_group_and_bad_payload() {
        let (d, _) = setup();
        let err = d
            .dispatch(1, 0, Message::new("group.dissolve", json!({"gid": 404})))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "group_not_found");

        let err = d
            .dispatch(1, 0, Message::new("group.member.remove", json!({"gid": "nope"})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BadPayload { .. }));
    }
}
