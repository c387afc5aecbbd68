// SPDX-License-Identifier: PolyForm-Shield-1.0

//! The Linker: a single-consumer translation queue converting broker-side
//! traffic into the upstream's command vocabulary.

use std::sync::Arc;
use std::time::Duration;

use protocol::{
    ActionSchema, ActionsForceData, ActionsRegisterData, ContextData, RegisteredActionEntry,
    TrafficItem, TrafficKind, UpstreamCommand,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{info, warn};

use crate::adapter::BackendAdapter;

const REQUEUE_DELAY: Duration = Duration::from_millis(200);

/// Drive the translation queue until the channel is closed (adapter shutdown).
pub async fn run_drain_loop(mut rx: mpsc::UnboundedReceiver<TrafficItem>, adapter: Arc<BackendAdapter>) {
    let tx = adapter.linker_sender();

    while let Some(item) = rx.recv().await {
        let envelope = match translate(&item, adapter.game_name()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed linker item {}: {:?}", item.id, e);
                continue;
            }
        };

        if !adapter.is_connected().await {
            time::sleep(REQUEUE_DELAY).await;
            let _ = tx.send(item);
            continue;
        }

        if let Err(e) = adapter.send_upstream(&envelope).await {
            let message = e.to_string().to_lowercase();
            if message.contains("connection") || message.contains("websocket") {
                let _ = tx.send(item);
            } else {
                warn!("discarding linker item {} after send error: {:?}", item.id, e);
            }
        }
    }

    info!("linker drain loop exiting: channel closed");
}

fn translate(item: &TrafficItem, game: &str) -> anyhow::Result<UpstreamCommand> {
    match item.kind {
        TrafficKind::RegisterActions => {
            let schemas: Vec<ActionSchema> = serde_json::from_value(item.body.clone())?;
            let actions = schemas
                .into_iter()
                .map(|s| RegisteredActionEntry {
                    name: s.action_name,
                    description: s.description,
                    schema: s.schema,
                })
                .collect();
            Ok(UpstreamCommand::ActionsRegister {
                game: game.to_string(),
                data: ActionsRegisterData { actions },
            })
        }
        TrafficKind::Event => translate_event(item, game),
    }
}

fn translate_event(item: &TrafficItem, game: &str) -> anyhow::Result<UpstreamCommand> {
    let event_name = item
        .body
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let payload = item.body.get("payload").cloned().unwrap_or(Value::Null);

    if payload.get("op").and_then(Value::as_str) == Some("choose_force_action") {
        let state = payload.get("state").cloned().unwrap_or(Value::Null);
        let query = payload
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ephemeral_context = payload
            .get("ephemeral_context")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let action_names = payload
            .get("actions")
            .and_then(Value::as_array)
            .map(|actions| {
                actions
                    .iter()
                    .filter_map(|a| a.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        return Ok(UpstreamCommand::ActionsForce {
            data: ActionsForceData {
                state: serde_json::to_string(&state)?,
                query,
                action_names,
                ephemeral_context,
            },
        });
    }

    let message = match event_name.as_str() {
        "integration_connected" => format!("{} connected", item.origin_integration),
        "integration_disconnected" => format!("{} disconnected", item.origin_integration),
        "action_test" => format!("{} ran an action test", item.origin_integration),
        _ => "message from integration".to_string(),
    };

    Ok(UpstreamCommand::Context {
        game: game.to_string(),
        data: ContextData {
            message,
            silent: true,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_item(event: &str, payload: Value) -> TrafficItem {
        TrafficItem::new(
            TrafficKind::Event,
            "alpha",
            json!({"event": event, "payload": payload}),
        )
    }

    #[test]
    fn translates_connect_event_to_silent_context() {
        let item = event_item("integration_connected", json!({}));
        let cmd = translate(&item, "demo").unwrap();
        match cmd {
            UpstreamCommand::Context { data, .. } => {
                assert!(data.silent);
                assert_eq!(data.message, "alpha connected");
            }
            _ => panic!("expected context command"),
        }
    }

    #[test]
    fn promotes_choose_force_action_payload() {
        let item = event_item(
            "custom",
            json!({
                "op": "choose_force_action",
                "state": {"hp": 1},
                "query": "pick",
                "ephemeral_context": true,
                "actions": [{"name": "A"}, {"name": "B"}],
            }),
        );
        let cmd = translate(&item, "demo").unwrap();
        match cmd {
            UpstreamCommand::ActionsForce { data } => {
                assert_eq!(data.action_names, vec!["A".to_string(), "B".to_string()]);
                assert_eq!(data.query, "pick");
                assert!(data.ephemeral_context);
            }
            _ => panic!("expected actions/force command"),
        }
    }

    #[test]
    fn translates_register_actions() {
        let schemas = vec![ActionSchema {
            integration_name: "alpha".into(),
            action_name: "ping".into(),
            description: "ping".into(),
            schema: None,
        }];
        let item = TrafficItem::new(
            TrafficKind::RegisterActions,
            "adapter",
            serde_json::to_value(schemas).unwrap(),
        );
        let cmd = translate(&item, "demo").unwrap();
        match cmd {
            UpstreamCommand::ActionsRegister { data, .. } => {
                assert_eq!(data.actions.len(), 1);
                assert_eq!(data.actions[0].name, "ping");
            }
            _ => panic!("expected actions/register command"),
        }
    }
}
