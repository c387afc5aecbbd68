// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Forced-action correlation scenarios, driven directly against the
//! adapter's `Forwarder` implementation rather than a real websocket — the
//! correlation logic has no dependency on the upstream connection being
//! live.

use std::time::Duration;

use backend_adapter::BackendAdapter;
use intermediary::{Broker, Forwarder};
use protocol::{ActionSummary, ForcedActionRequest};
use serde_json::json;
use tokio::time;

fn test_broker() -> std::sync::Arc<Broker> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.bin");
    // `choose_force_action` never touches the durable queue, so the
    // directory need not outlive this call.
    Broker::new("token", path).unwrap()
}

fn two_actions() -> Vec<ActionSummary> {
    vec![
        ActionSummary {
            name: "A".into(),
            description: "first".into(),
        },
        ActionSummary {
            name: "B".into(),
            description: "second".into(),
        },
    ]
}

#[tokio::test]
async fn first_reply_wins_and_later_ones_are_dropped() {
    let broker = test_broker();
    let (adapter, _linker_rx) = BackendAdapter::new(broker, "ws://127.0.0.1:1", "demo");

    let request_adapter = adapter.clone();
    let handle = tokio::spawn(async move {
        request_adapter
            .choose_force_action(ForcedActionRequest {
                game_title: "demo".into(),
                state: json!({}),
                query: "pick one".into(),
                ephemeral_context: false,
                actions: two_actions(),
            })
            .await
    });

    time::sleep(Duration::from_millis(50)).await;
    adapter
        .forward("gamma", json!({"choice": {"selected": "B", "data": {"k": 1}}}))
        .await
        .unwrap();

    time::sleep(Duration::from_millis(50)).await;
    // A second reply after the first must be silently discarded.
    adapter
        .forward("alpha", json!({"choice": {"selected": "A"}}))
        .await
        .unwrap();

    let reply = handle.await.unwrap();
    assert_eq!(reply.selected_action_name, "B");
    assert_eq!(reply.data, json!({"k": 1}).to_string());
}

#[tokio::test]
async fn timeout_falls_back_to_first_action() {
    let broker = test_broker();
    let (adapter, _linker_rx) = BackendAdapter::new(broker, "ws://127.0.0.1:1", "demo");

    let reply = time::timeout(
        Duration::from_secs(9),
        adapter.choose_force_action(ForcedActionRequest {
            game_title: "demo".into(),
            state: json!({}),
            query: "pick one".into(),
            ephemeral_context: false,
            actions: two_actions(),
        }),
    )
    .await
    .expect("choose_force_action should resolve via its own 8s deadline");

    assert_eq!(reply.selected_action_name, "A");
    assert_eq!(reply.data, "{}");
}

#[tokio::test]
async fn empty_action_list_falls_back_to_sentinel() {
    let broker = test_broker();
    let (adapter, _linker_rx) = BackendAdapter::new(broker, "ws://127.0.0.1:1", "demo");

    let reply = time::timeout(
        Duration::from_secs(9),
        adapter.choose_force_action(ForcedActionRequest {
            game_title: "demo".into(),
            state: json!({}),
            query: "pick one".into(),
            ephemeral_context: false,
            actions: vec![],
        }),
    )
    .await
    .unwrap();

    assert_eq!(reply.selected_action_name, "__no_action__");
}
