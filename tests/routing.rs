//! Integration tests for action routing across nodes.

mod common;

use common::node::ECHO_BACKEND;
use common::TestNode;
use serde_json::json;

#[tokio::test]
async fn unknown_namespace_is_unresolved() {
    let server = TestNode::spawn("route-unresolved", ECHO_BACKEND)
        .await
        .expect("Failed to start node");
    let mut client = server.signed_in(1, 1).await.expect("sign in");

    let reply = client
        .request("nowhere.app.call", json!({}))
        .await
        .expect("No reply");
    assert_eq!(reply.data["error"], "route_unresolved");

    server.stop().await;
}

#[tokio::test]
async fn static_service_with_namespace_alias() {
    let store = TestNode::spawn(
        "route-store",
        r#"
[[backends]]
name = "store"
handler = "echo"
"#,
    )
    .await
    .expect("Failed to start store node");
    let store_addr = store.node().backends()[0].addr;

    let gateway = TestNode::spawn(
        "route-static",
        &format!(
            r#"
[[services]]
name = "store"
discovery = "static"
endpoints = ["{store_addr}"]
namespaces = ["kv"]
{ECHO_BACKEND}"#
        ),
    )
    .await
    .expect("Failed to start gateway node");

    let table = gateway.node().router().local().expect("local router").table();
    assert_eq!(
        table.service("store").map(|s| s.policy),
        Some(imgate_proto::RoutePolicy::RoundRobin)
    );

    let mut client = gateway.signed_in(3, 1).await.expect("sign in");
    let reply = client
        .request("kv.get", json!({"key": "a"}))
        .await
        .expect("No reply");
    assert_eq!(reply.data, json!({"key": "a"}));

    let reply = client
        .request("store.put", json!({"key": "a", "value": 1}))
        .await
        .expect("No reply");
    assert_eq!(reply.data["value"], 1);

    gateway.stop().await;
    store.stop().await;
}

#[tokio::test]
async fn gateway_routes_through_remote_route_node() {
    let route = TestNode::spawn(
        "route-node",
        &format!("rpc = \"127.0.0.1:0\"\n{ECHO_BACKEND}"),
    )
    .await
    .expect("Failed to start route node");
    let rpc = route.node().rpc_addr().expect("route rpc bound");

    let gateway = TestNode::spawn(
        "route-edge",
        &format!(
            r#"
[router]
mode = "remote"
remote_address = "{rpc}"

[[backends]]
name = "chat"
handler = "echo"
"#
        ),
    )
    .await
    .expect("Failed to start gateway node");
    assert!(gateway.node().router().local().is_none());

    // sign-in is forwarded to the route node's auth backend
    let mut edge_client = gateway.signed_in(11, 1).await.expect("sign in at edge");
    assert!(gateway.node().registry().is_device_online(11, 1));
    assert!(!route.node().registry().is_online(11));

    let reply = edge_client
        .request("api.app.echo", json!("via route node"))
        .await
        .expect("No reply");
    assert_eq!(reply.data, json!("via route node"));

    // the edge's own backend registered itself with the route node
    let router = route.node().router().local().expect("local router").clone();
    assert!(router.table().service("chat").is_some());
    let mut core_client = route.signed_in(12, 1).await.expect("sign in at core");
    let reply = core_client
        .request("chat.room.say", json!({"text": "hi"}))
        .await
        .expect("No reply");
    assert_eq!(reply.data["text"], "hi");

    gateway.stop().await;
    route.stop().await;
}

#[tokio::test]
async fn deregistered_service_stops_resolving() {
    let server = TestNode::spawn(
        "route-dereg",
        &format!(
            r#"{ECHO_BACKEND}
[[backends]]
name = "temp"
handler = "echo"
"#
        ),
    )
    .await
    .expect("Failed to start node");
    let mut client = server.signed_in(1, 1).await.expect("sign in");

    let reply = client.request("temp.x", json!(1)).await.expect("No reply");
    assert_eq!(reply.data, json!(1));

    server
        .node()
        .router()
        .deregister("temp")
        .await
        .expect("deregister failed");
    let reply = client.request("temp.x", json!(1)).await.expect("No reply");
    assert_eq!(reply.data["error"], "route_unresolved");

    server.stop().await;
}
