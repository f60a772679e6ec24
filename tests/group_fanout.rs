//! Integration tests for group presence and notify fan-out.

mod common;

use common::node::ECHO_BACKEND;
use common::{TestClient, TestNode, eventually};
use serde_json::json;
use std::time::Duration;

async fn group_with_members(owner: &mut TestClient, gid: i64, members: serde_json::Value) {
    let reply = owner
        .request("group.create", json!({"gid": gid, "name": "friends"}))
        .await
        .expect("No create reply");
    assert_eq!(reply.data["gid"], gid);
    let reply = owner
        .request("group.member.put", json!({"gid": gid, "members": members}))
        .await
        .expect("No put reply");
    assert_eq!(reply.data["skipped"], json!([]));
}

#[tokio::test]
async fn notify_fans_out_to_online_members() {
    let server = TestNode::spawn("fan-basic", ECHO_BACKEND)
        .await
        .expect("Failed to start node");
    let mut alice = server.signed_in(1, 1).await.expect("alice");
    let mut bob = server.signed_in(2, 1).await.expect("bob");
    let mut carol = server.signed_in(3, 1).await.expect("carol");
    let mut outsider = server.signed_in(4, 1).await.expect("outsider");

    group_with_members(&mut alice, 10, json!({"1": 1, "2": 0, "3": 0})).await;

    let reply = alice
        .request(
            "group.notify",
            json!({"gid": 10, "action": "im.group.text", "data": "hello all"}),
        )
        .await
        .expect("No notify reply");
    assert_eq!(reply.data["delivered"], 3);

    for member in [&mut bob, &mut carol] {
        let notice = member.recv_action("im.group.text").await.expect("no notice");
        assert_eq!(notice.data, json!("hello all"));
        assert_eq!(notice.from, 1);
    }
    assert!(outsider.is_quiet(Duration::from_millis(100)).await);

    server.stop().await;
}

#[tokio::test]
async fn late_sign_in_joins_existing_groups() {
    let server = TestNode::spawn("fan-late", ECHO_BACKEND)
        .await
        .expect("Failed to start node");
    let mut alice = server.signed_in(1, 1).await.expect("alice");
    group_with_members(&mut alice, 20, json!({"1": 1, "2": 0})).await;
    assert!(!server.node().groups().is_subscribed(20, 2));

    let mut bob = server.signed_in(2, 7).await.expect("bob");
    assert!(server.node().groups().is_subscribed(20, 2));

    let reply = alice
        .request("group.notify", json!({"gid": 20, "action": "im.group.text", "data": 1}))
        .await
        .expect("No notify reply");
    assert_eq!(reply.data["delivered"], 2);
    bob.recv_action("im.group.text").await.expect("bob got nothing");

    server.stop().await;
}

#[tokio::test]
async fn mute_suppresses_regular_members() {
    let server = TestNode::spawn("fan-mute", ECHO_BACKEND)
        .await
        .expect("Failed to start node");
    let mut alice = server.signed_in(1, 1).await.expect("alice");
    let mut bob = server.signed_in(2, 1).await.expect("bob");
    group_with_members(&mut alice, 30, json!({"1": 0, "2": 0})).await;

    let reply = alice
        .request("group.mute", json!({"gid": 30}))
        .await
        .expect("No mute reply");
    assert_eq!(reply.data["muted"], true);

    let reply = bob
        .request("group.notify", json!({"gid": 30, "action": "im.group.text", "data": "psst"}))
        .await
        .expect("No notify reply");
    assert_eq!(reply.data["suppressed"], true);
    assert_eq!(reply.data["delivered"], 0);
    assert!(alice.is_quiet(Duration::from_millis(100)).await);

    // the owner still gets through
    let reply = alice
        .request("group.notify", json!({"gid": 30, "action": "im.group.text", "data": "ok"}))
        .await
        .expect("No notify reply");
    assert_eq!(reply.data["delivered"], 2);

    alice
        .request("group.mute", json!({"gid": 30, "mute": false}))
        .await
        .expect("No unmute reply");
    let reply = bob
        .request("group.notify", json!({"gid": 30, "action": "im.group.text", "data": "back"}))
        .await
        .expect("No notify reply");
    assert_eq!(reply.data["delivered"], 2);

    server.stop().await;
}

#[tokio::test]
async fn disconnect_and_removal_shrink_the_audience() {
    let server = TestNode::spawn("fan-shrink", ECHO_BACKEND)
        .await
        .expect("Failed to start node");
    let mut alice = server.signed_in(1, 1).await.expect("alice");
    let bob = server.signed_in(2, 1).await.expect("bob");
    let _carol = server.signed_in(3, 1).await.expect("carol");
    group_with_members(&mut alice, 40, json!({"1": 1, "2": 0, "3": 0})).await;

    drop(bob);
    let groups = server.node().groups().clone();
    assert!(
        eventually(Duration::from_secs(2), || !groups.is_subscribed(40, 2)).await,
        "disconnected member still subscribed"
    );
    assert!(groups.is_member(40, 2));

    let reply = alice
        .request("group.member.remove", json!({"gid": 40, "uids": [3]}))
        .await
        .expect("No remove reply");
    assert_eq!(reply.data["applied"], 1);

    let reply = alice
        .request("group.notify", json!({"gid": 40, "action": "im.group.text"}))
        .await
        .expect("No notify reply");
    assert_eq!(reply.data["delivered"], 1);

    let reply = alice
        .request("group.dissolve", json!({"gid": 40}))
        .await
        .expect("No dissolve reply");
    assert_eq!(reply.data["gid"], 40);
    let reply = alice
        .request("group.notify", json!({"gid": 40, "action": "im.group.text"}))
        .await
        .expect("No notify reply");
    assert_eq!(reply.data["error"], "group_not_found");

    server.stop().await;
}
