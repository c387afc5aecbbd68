// SPDX-License-Identifier: PolyForm-Shield-1.0

//! The backend adapter: the upstream websocket client. Owns the only
//! connection to the Backend, runs the reconnect-with-backoff loop, and
//! implements [`intermediary::Forwarder`] so the broker can hand it every
//! integration payload.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use intermediary::{Broker, Forwarder, LifecycleObserver};
use protocol::{
    ActionSummary, AddContextEvent, ChoiceEnvelope, ChoicePayload, ChooseActionEvent,
    ChooseActionRequestEvent, EnvironmentContextCommand, ForcedActionBroadcastPayload,
    ForcedActionReply, ForcedActionRequest, IntermediaryForwardPayload, TrafficItem, TrafficKind,
    UpstreamCommand,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use crate::error::AdapterError;
use crate::linker;

const MAX_CONNECT_RETRIES: u32 = 10;
const BASE_BACKOFF_SECS: f64 = 1.0;
const MAX_BACKOFF_SECS: f64 = 128.0;
const FORCED_ACTION_TIMEOUT: Duration = Duration::from_secs(8);
const NO_ACTION_SENTINEL: &str = "__no_action__";

type UpstreamStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Inbound trigger for a forced action, mirroring the outbound `command`
/// convention. The Backend is expected to send this shape when it needs an
/// integration to pick an action right now.
#[derive(Debug, Clone, Deserialize)]
struct ForcedActionUpstreamRequest {
    command: String,
    game_title: String,
    state: Value,
    query: String,
    #[serde(default)]
    ephemeral_context: bool,
    actions: Vec<ActionSummary>,
}

pub struct BackendAdapter {
    broker: Arc<Broker>,
    upstream_url: String,
    game: String,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    pending_choice: Mutex<Option<oneshot::Sender<ForcedActionReply>>>,
    choice_gate: Mutex<()>,
    linker_tx: mpsc::UnboundedSender<TrafficItem>,
}

impl BackendAdapter {
    pub fn new(broker: Arc<Broker>, upstream_url: impl Into<String>, game: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<TrafficItem>) {
        let (linker_tx, linker_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            broker,
            upstream_url: upstream_url.into(),
            game: game.into(),
            outbound: RwLock::new(None),
            pending_choice: Mutex::new(None),
            choice_gate: Mutex::new(()),
            linker_tx,
        });
        (adapter, linker_rx)
    }

    pub fn game_name(&self) -> &str {
        &self.game
    }

    pub fn linker_sender(&self) -> mpsc::UnboundedSender<TrafficItem> {
        self.linker_tx.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.outbound.read().await.is_some()
    }

    /// Run the reconnect loop and the Linker drain loop until the process
    /// shuts down. Never returns under normal operation.
    pub async fn run(self: Arc<Self>, linker_rx: mpsc::UnboundedReceiver<TrafficItem>) {
        let drain_adapter = self.clone();
        tokio::spawn(async move {
            linker::run_drain_loop(linker_rx, drain_adapter).await;
        });
        self.connect_loop().await;
    }

    async fn connect_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut abandoned = false;

        loop {
            match self.try_connect().await {
                Ok(stream) => {
                    attempt = 0;
                    info!("connected to upstream backend at {}", self.upstream_url);
                    self.run_startup_sequence().await;
                    self.read_loop(stream).await;
                    *self.outbound.write().await = None;
                    warn!("upstream connection lost; reconnecting");
                }
                Err(e) => {
                    if attempt == MAX_CONNECT_RETRIES && !abandoned {
                        error!(
                            "upstream connect retries exhausted after {} attempts ({:?}); continuing to retry on the capped backoff without a working upstream",
                            attempt, e
                        );
                        abandoned = true;
                    } else if !abandoned {
                        warn!("upstream connect attempt {} failed: {:?}", attempt, e);
                    }
                }
            }

            let exponent = attempt.min(6) as i32;
            let delay = (BASE_BACKOFF_SECS * 2f64.powi(exponent)).min(MAX_BACKOFF_SECS);
            attempt = attempt.saturating_add(1);
            time::sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    async fn try_connect(&self) -> Result<UpstreamStream> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.upstream_url)
            .await
            .map_err(|e| anyhow!("websocket connect to upstream failed: {e}"))?;
        let (sink, stream) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            let mut sink = sink;
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        *self.outbound.write().await = Some(tx);
        Ok(stream)
    }

    async fn run_startup_sequence(&self) {
        let startup = UpstreamCommand::Startup {
            data: serde_json::json!({ "game": self.game }),
        };
        let _ = self.send_upstream(&startup).await;

        let actions = self.broker.registries().collect_all_actions().await;
        if !actions.is_empty() {
            let schemas: Vec<protocol::ActionSchema> = actions.into_values().collect();
            if let Ok(body) = serde_json::to_value(&schemas) {
                let _ = self
                    .linker_tx
                    .send(TrafficItem::new(TrafficKind::RegisterActions, "adapter", body));
            }
        }

        let connected = self.broker.registries().connected_integration_names().await;
        let env_ctx = EnvironmentContextCommand::new(
            self.game.clone(),
            format!("{} relay", self.game),
            connected,
        );
        let _ = self.send_json(&env_ctx).await;
    }

    async fn read_loop(self: &Arc<Self>, mut stream: UpstreamStream) {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle_upstream_frame(text).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("upstream read error: {:?}", e);
                    break;
                }
            }
        }
    }

    async fn handle_upstream_frame(self: &Arc<Self>, text: String) {
        if let Ok(req) = serde_json::from_str::<ForcedActionUpstreamRequest>(&text) {
            if req.command == "actions/force_request" {
                self.spawn_forced_action(req);
                return;
            }
        }

        let action: protocol::ActionMessage = match serde_json::from_str(&text) {
            Ok(a) => a,
            Err(e) => {
                warn!("discarding unrecognized upstream frame: {:?}", e);
                return;
            }
        };

        if action.name == "add_context" {
            self.handle_add_context(&action.data).await;
            return;
        }

        let data: Value = serde_json::from_str(&action.data).unwrap_or(Value::Null);
        let payload = IntermediaryForwardPayload::new(action.name, data, action.id);
        self.broker.registries().notify_watchers(&payload).await;
    }

    async fn handle_add_context(&self, raw_data: &str) {
        let data: Value = serde_json::from_str(raw_data).unwrap_or(Value::Null);
        let game_title = data
            .get("game_title")
            .and_then(Value::as_str)
            .unwrap_or(&self.game)
            .to_string();
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let reply_if_not_busy = data
            .get("reply_if_not_busy")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.broker
            .registries()
            .notify_watchers(&AddContextEvent::new(game_title, message, reply_if_not_busy))
            .await;
    }

    fn spawn_forced_action(self: &Arc<Self>, req: ForcedActionUpstreamRequest) {
        let adapter = self.clone();
        tokio::spawn(async move {
            let reply = adapter
                .choose_force_action(ForcedActionRequest {
                    game_title: req.game_title,
                    state: req.state,
                    query: req.query,
                    ephemeral_context: req.ephemeral_context,
                    actions: req.actions,
                })
                .await;

            let envelope = UpstreamCommand::Context {
                game: adapter.game.clone(),
                data: protocol::ContextData {
                    message: serde_json::to_string(&serde_json::json!({
                        "selected_action_name": reply.selected_action_name,
                        "data": reply.data,
                    }))
                    .unwrap_or_default(),
                    silent: true,
                },
            };
            let _ = adapter.send_upstream(&envelope).await;
        });
    }

    /// Arbitrate a forced-action choice against the integration population.
    /// Concurrent callers are serialized: only one forced-action round can
    /// be in flight at a time.
    pub async fn choose_force_action(self: &Arc<Self>, req: ForcedActionRequest) -> ForcedActionReply {
        let _serialized = self.choice_gate.lock().await;

        let broadcast_payload = ForcedActionBroadcastPayload {
            game_title: req.game_title,
            state: req.state,
            query: req.query,
            ephemeral_context: req.ephemeral_context,
            actions: req.actions.clone(),
        };

        self.broker
            .registries()
            .notify_watchers(&ChooseActionEvent::new(broadcast_payload.clone()))
            .await;

        let (tx, rx) = oneshot::channel();
        *self.pending_choice.lock().await = Some(tx);

        let request_event = ChooseActionRequestEvent::new(broadcast_payload);
        self.broker
            .registries()
            .broadcast_to_integrations(&request_event)
            .await;
        self.broker.registries().notify_watchers(&request_event).await;

        match time::timeout(FORCED_ACTION_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            _ => {
                *self.pending_choice.lock().await = None;
                fallback_reply(&req.actions)
            }
        }
    }

    async fn submit_choice(&self, choice: ChoicePayload) {
        let mut guard = self.pending_choice.lock().await;
        if let Some(tx) = guard.take() {
            let data = match &choice.data {
                Value::Null => "{}".to_string(),
                v => v.to_string(),
            };
            let _ = tx.send(ForcedActionReply {
                selected_action_name: choice.selected,
                data,
            });
        }
    }

    pub(crate) async fn send_upstream(&self, cmd: &UpstreamCommand) -> Result<()> {
        self.send_json(cmd).await
    }

    async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let guard = self.outbound.read().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|_| AdapterError::SendFailed("writer task gone".to_string()).into()),
            None => Err(AdapterError::NotConnected.into()),
        }
    }
}

fn fallback_reply(actions: &[ActionSummary]) -> ForcedActionReply {
    match actions.first() {
        Some(a) => ForcedActionReply {
            selected_action_name: a.name.clone(),
            data: "{}".to_string(),
        },
        None => ForcedActionReply {
            selected_action_name: NO_ACTION_SENTINEL.to_string(),
            data: "{}".to_string(),
        },
    }
}

#[async_trait]
impl Forwarder for BackendAdapter {
    async fn forward(&self, origin_integration: &str, payload: Value) -> Result<Value> {
        if let Ok(envelope) = serde_json::from_value::<ChoiceEnvelope>(payload.clone()) {
            envelope.choice.validate()?;
            self.submit_choice(envelope.choice).await;
            return Ok(serde_json::json!({ "accepted": true }));
        }

        self.linker_tx
            .send(TrafficItem::new(
                TrafficKind::Event,
                origin_integration,
                serde_json::json!({ "event": "integration_message", "payload": payload.clone() }),
            ))
            .map_err(|_| anyhow!("linker queue closed"))?;

        Ok(serde_json::json!({ "accepted": true }))
    }
}

impl LifecycleObserver for BackendAdapter {
    fn on_integration_connected(&self, name: &str) {
        let _ = self.linker_tx.send(TrafficItem::new(
            TrafficKind::Event,
            name,
            serde_json::json!({ "event": "integration_connected", "payload": {} }),
        ));
    }

    fn on_integration_disconnected(&self, name: &str) {
        let _ = self.linker_tx.send(TrafficItem::new(
            TrafficKind::Event,
            name,
            serde_json::json!({ "event": "integration_disconnected", "payload": {} }),
        ));
    }
}
