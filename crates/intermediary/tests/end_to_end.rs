// SPDX-License-Identifier: PolyForm-Shield-1.0

//! End-to-end scenarios against a real broker listening on a loopback
//! socket, driven by genuine websocket clients.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const AUTH_TOKEN: &str = "test-token";

/// Reserve an ephemeral loopback port, then hand it to a freshly-built
/// broker running in the background. Returns once the port accepts TCP
/// connections.
async fn spawn_broker() -> (SocketAddr, std::sync::Arc<intermediary::Broker>) {
    let reservation = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reservation.local_addr().unwrap();
    drop(reservation);

    let queue_path = std::env::temp_dir().join(format!("relay-e2e-{}.bin", addr.port()));
    let _ = std::fs::remove_file(&queue_path);

    let broker = intermediary::Broker::new(AUTH_TOKEN, queue_path).unwrap();
    tokio::spawn(broker.clone().start(addr));

    for _ in 0..40 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            break;
        }
        time::sleep(Duration::from_millis(50)).await;
    }

    (addr, broker)
}

async fn connect_peer(addr: SocketAddr, peer_type: &str, name: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{addr}");
    let (mut ws, _) = connect_async(&url).await.unwrap();
    let frame = json!({ "type": peer_type, "name": name, "auth_token": AUTH_TOKEN });
    ws.send(Message::Text(frame.to_string())).await.unwrap();
    ws
}

async fn next_json(ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

/// Read frames off `ws` until one matches `event`, skipping connect/disconnect
/// notifications unrelated to the assertion at hand.
async fn next_json_matching(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    event: &str,
) -> Value {
    loop {
        let value = next_json(ws).await;
        if value.get("event").and_then(Value::as_str) == Some(event) {
            return value;
        }
    }
}

/// Read frames off `ws` until one that is a direct reply (no `event` key) —
/// skips the watcher fan-out notifications a peer's own connect emits.
async fn next_reply(ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>) -> Value {
    loop {
        let value = next_json(ws).await;
        if value.get("event").is_none() {
            return value;
        }
    }
}

#[tokio::test]
async fn happy_path_fan_out() {
    let (addr, _broker) = spawn_broker().await;

    let mut ops = connect_peer(addr, "neuro-os", "ops").await;
    let mut alpha = connect_peer(addr, "integration", "alpha").await;

    // Drain both registration acks off the wire (none are sent on success,
    // but give the broker a moment to install both peers before `alpha`
    // sends its payload).
    time::sleep(Duration::from_millis(100)).await;

    alpha
        .send(Message::Text(json!({"hello": 1}).to_string()))
        .await
        .unwrap();

    let notification = next_json_matching(&mut ops, "integration_message").await;
    assert_eq!(notification["from"], "alpha");
    assert_eq!(notification["payload"], json!({"hello": 1}));
}

#[tokio::test]
async fn watcher_command_to_missing_integration_is_not_queued() {
    let (addr, _broker) = spawn_broker().await;
    let mut ops = connect_peer(addr, "neuro-os", "ops").await;
    time::sleep(Duration::from_millis(100)).await;

    ops.send(Message::Text(
        json!({"target": "beta", "cmd": {"action": "ping"}}).to_string(),
    ))
    .await
    .unwrap();

    let reply = next_reply(&mut ops).await;
    assert_eq!(reply["error"], "invalid target/cmd");
    assert_eq!(_broker.queue_depth().await, 0);
}

#[tokio::test]
async fn queued_delivery_reaches_integration_after_it_connects() {
    let (addr, broker) = spawn_broker().await;

    broker
        .send_to_integration("beta", json!({"x": 1}))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth().await, 1);

    let mut beta = connect_peer(addr, "integration", "beta").await;

    let delivered = time::timeout(Duration::from_secs(6), next_json(&mut beta))
        .await
        .expect("expected the durable queue to drain within the 5s tick");
    assert_eq!(delivered, json!({"x": 1}));
    assert_eq!(broker.queue_depth().await, 0);
}
