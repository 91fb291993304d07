use crate::*;

use ferry_services::{DiscoveredPeer, DiscoverySource};
use serde_json::{json, Value};

const T: Duration = Duration::from_secs(20);

/// Serve `node`'s HTTP API on an ephemeral loopback port.
async fn api(node: &Node) -> String {
    let state = ferry_api::ApiState {
        sessions: node.sessions.clone(),
        scheduler: node.scheduler.clone(),
        registry: node.registry.clone(),
        device_id: format!("{}-id", node.name),
        device_name: node.name.clone(),
        listen_port: node.addr.port(),
        chunk_size: node.opts.chunk_size,
        retention: Duration::from_secs(3600),
        started_at: Instant::now(),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, ferry_api::router(state)).await.unwrap();
    });
    format!("http://{addr}/api")
}

async fn get(url: &str) -> (u16, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn post(url: &str, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new().post(url).json(&body).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

/// Discover B, send through the API, watch the session complete.
#[tokio::test]
async fn test_send_and_inspect_over_http() {
    let a = Node::start("a").await;
    let b = Node::start("b").await;
    let base = api(&a).await;

    a.registry.upsert(DiscoveredPeer::new(
        "b-id".into(),
        "b".into(),
        b.addr,
        DiscoverySource::Scan,
    ));
    let (code, peers) = get(&format!("{base}/peers")).await;
    assert_eq!(code, 200);
    assert_eq!(peers["peers"][0]["id"], "b-id");
    assert_eq!(peers["peers"][0]["source"], "scan");

    let file = a.source("via-api.txt", b"sent over http");
    let (code, sent) = post(
        &format!("{base}/send"),
        json!({ "peer_id": "b-id", "paths": [file.content.path()] }),
    )
    .await;
    assert_eq!(code, 200, "send: {sent}");
    assert_eq!(sent["files"], 1);
    assert_eq!(sent["total_bytes"], 14);
    let id = sent["session_id"].as_str().unwrap().to_string();

    wait_for("completion", T, || {
        a.sessions
            .get(&id)
            .is_some_and(|s| s.status == ferry_core::SessionStatus::Completed)
    })
    .await
    .unwrap();

    let (code, info) = get(&format!("{base}/sessions/{id}")).await;
    assert_eq!(code, 200);
    assert_eq!(info["status"], "completed");
    assert_eq!(info["direction"], "outbound");
    assert_eq!(info["progress_percent"], 100.0);
    assert_eq!(info["running"], false);

    let (_, status) = get(&format!("{base}/status")).await;
    assert_eq!(status["device_name"], "a");
    assert_eq!(status["sessions"]["completed"], 1);
    assert_eq!(status["peers_discovered"], 1);

    assert_eq!(read(&b.downloads().join("via-api.txt")), b"sent over http");
}

#[tokio::test]
async fn test_http_errors() {
    let a = Node::start("a").await;
    let base = api(&a).await;

    let (code, _) = post(
        &format!("{base}/send"),
        json!({ "peer_id": "nobody", "paths": ["/etc/hostname"] }),
    )
    .await;
    assert_eq!(code, 404);

    let (code, _) = get(&format!("{base}/sessions/missing")).await;
    assert_eq!(code, 404);

    let (code, _) = post(&format!("{base}/sessions/missing/pause"), json!({})).await;
    assert_eq!(code, 404);

    // A pending session has nothing to pause.
    let b = Node::start("b").await;
    let pending = a
        .sessions
        .create_outbound(b.peer_ref(), vec![a.source("p.txt", b"p")], None)
        .unwrap();
    let (code, _) = post(&format!("{base}/sessions/{}/pause", pending.id), json!({})).await;
    assert_eq!(code, 409);
    let (code, _) = post(&format!("{base}/sessions/{}/retry", pending.id), json!({})).await;
    assert_eq!(code, 409);
}

#[tokio::test]
async fn test_cleanup_over_http() {
    let a = Node::start("a").await;
    let b = Node::start("b").await;
    let base = api(&a).await;

    let file = a.source("old.txt", b"old");
    let session = a.send(b.peer_ref(), vec![file]);
    wait_for("completion", T, || {
        a.sessions.get(&session.id).unwrap().status == ferry_core::SessionStatus::Completed
    })
    .await
    .unwrap();

    // Default retention keeps it.
    let (_, kept) = post(&format!("{base}/sessions/cleanup"), json!({})).await;
    assert_eq!(kept["removed"], 0);

    let (_, removed) = post(&format!("{base}/sessions/cleanup?max_age_secs=0"), json!({})).await;
    assert_eq!(removed["removed"], 1);
    let (_, again) = post(&format!("{base}/sessions/cleanup?max_age_secs=0"), json!({})).await;
    assert_eq!(again["removed"], 0);

    let (_, list) = get(&format!("{base}/sessions")).await;
    assert!(list["sessions"].as_array().unwrap().is_empty());
}
