// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Intercept observation scenario: the intercept proxy registers with the
//! Intermediary as an ordinary integration and mirrors recognized
//! client→upstream commands as `integration_connected`/`integration_disconnected`
//! observations, which watchers see as plain `integration_message` fan-out.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_cli::intercept_proxy::{self, InterceptConfig};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const AUTH_TOKEN: &str = "test-token";

async fn reserve_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn wait_for_port(addr: SocketAddr) {
    for _ in 0..40 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    panic!("nothing ever listened on {addr}");
}

async fn spawn_broker() -> SocketAddr {
    let addr = reserve_port().await;
    let queue_path = std::env::temp_dir().join(format!("relay-intercept-test-{}.bin", addr.port()));
    let _ = std::fs::remove_file(&queue_path);

    let broker = intermediary::Broker::new(AUTH_TOKEN, queue_path).unwrap();
    tokio::spawn(broker.start(addr));
    wait_for_port(addr).await;
    addr
}

/// A bare echo-less websocket server standing in for the real upstream the
/// intercept proxy dials — it only needs to accept the handshake.
async fn spawn_dummy_upstream() -> SocketAddr {
    let addr = reserve_port().await;
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    let (_sink, mut stream) = ws.split();
                    while stream.next().await.is_some() {}
                }
            });
        }
    });
    wait_for_port(addr).await;
    addr
}

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_watcher(addr: SocketAddr, name: &str) -> Ws {
    let (mut ws, _) = connect_async(&format!("ws://{addr}")).await.unwrap();
    let frame = json!({ "type": "neuro-os", "name": name, "auth_token": AUTH_TOKEN });
    ws.send(Message::Text(frame.to_string())).await.unwrap();
    ws
}

async fn next_json_matching(ws: &mut Ws, event: &str) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value.get("event").and_then(Value::as_str) == Some(event) {
                    return value;
                }
            }
            Some(Ok(_)) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn intercept_proxy_observes_matched_commands() {
    let broker_addr = spawn_broker().await;
    let upstream_addr = spawn_dummy_upstream().await;
    let proxy_addr = reserve_port().await;

    let mut ops = connect_watcher(broker_addr, "ops").await;

    let config = InterceptConfig {
        listen: proxy_addr,
        upstream_url: format!("ws://{upstream_addr}"),
        match_commands: vec!["startup".to_string()],
        integration_name: "intercept-proxy".to_string(),
        intermediary_url: format!("ws://{broker_addr}"),
        auth_token: AUTH_TOKEN.to_string(),
    };
    tokio::spawn(intercept_proxy::run(config));
    wait_for_port(proxy_addr).await;
    // give the proxy's own registration with the broker time to land before
    // the client connects and starts sending frames.
    time::sleep(Duration::from_millis(200)).await;

    let (mut client, _) = connect_async(&format!("ws://{proxy_addr}")).await.unwrap();
    client
        .send(Message::Text(json!({"command": "startup", "game": "demo"}).to_string()))
        .await
        .unwrap();

    let notification = next_json_matching(&mut ops, "integration_message").await;
    assert_eq!(notification["from"], "intercept-proxy");
    assert_eq!(notification["payload"]["event"], "integration_connected");
    assert_eq!(notification["payload"]["via"], "intercept-proxy");
    assert_eq!(notification["payload"]["details"]["first_command"], "startup");
    assert!(notification["payload"]["details"]["snippet"]
        .as_str()
        .unwrap()
        .contains("startup"));

    // A second, unmatched command must not produce another observation —
    // `first_command` latches on the first match only.
    client
        .send(Message::Text(json!({"command": "other"}).to_string()))
        .await
        .unwrap();

    drop(client);

    let disconnect = next_json_matching(&mut ops, "integration_message").await;
    assert_eq!(disconnect["payload"]["event"], "integration_disconnected");
    assert_eq!(disconnect["payload"]["details"]["first_command"], "startup");
}
