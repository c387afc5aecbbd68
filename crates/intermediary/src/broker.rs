// SPDX-License-Identifier: PolyForm-Shield-1.0

//! The Intermediary: accepts websocket connections from integrations and
//! watchers, authenticates and classifies them, routes messages between
//! the two populations, and drains the durable queue toward integrations
//! that were absent at enqueue time.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use protocol::{
    ActionSchema, BinaryReceivedEvent, ErrorReply, IntegrationMessageEvent, PeerConnectedEvent,
    PeerDisconnectedEvent, PeerType, RawTextAction, RegisterFrame, SentReply,
    WatcherCommandFrame, WatcherToIntegration,
};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::forward::{Forwarder, LifecycleObserver};
use crate::queue_drain::PendingQueue;
use crate::registry::{PeerConn, Registries};

/// Interval between `BrokerMetrics` heartbeat log lines.
const METRICS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

pub struct Broker {
    registries: Registries,
    queue: std::sync::Arc<PendingQueue>,
    forwarder: OnceLock<std::sync::Arc<dyn Forwarder>>,
    lifecycle: OnceLock<std::sync::Arc<dyn LifecycleObserver>>,
    auth_token: String,
}

impl Broker {
    pub fn new(auth_token: impl Into<String>, relay_queue_path: impl Into<PathBuf>) -> Result<std::sync::Arc<Self>> {
        let queue = PendingQueue::restore(relay_queue_path.into())?;
        Ok(std::sync::Arc::new(Self {
            registries: Registries::new(),
            queue: std::sync::Arc::new(queue),
            forwarder: OnceLock::new(),
            lifecycle: OnceLock::new(),
            auth_token: auth_token.into(),
        }))
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Install the forwarder hook. Intended to be called exactly once,
    /// before the broker starts accepting connections.
    pub fn install_forwarder(&self, forwarder: std::sync::Arc<dyn Forwarder>) {
        if self.forwarder.set(forwarder).is_err() {
            warn!("forwarder already installed; ignoring second install attempt");
        }
    }

    pub fn install_lifecycle_observer(&self, observer: std::sync::Arc<dyn LifecycleObserver>) {
        if self.lifecycle.set(observer).is_err() {
            warn!("lifecycle observer already installed; ignoring second install attempt");
        }
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.depth().await
    }

    /// Send `payload` to `target`; if absent, enqueue it durably.
    pub async fn send_to_integration(&self, target: &str, payload: Value) -> Result<()> {
        if self.registries.send_to_integration(target, &payload).await {
            return Ok(());
        }
        self.queue.enqueue(target, payload).await
    }

    pub async fn start(self: std::sync::Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BrokerError::Bind(addr, e.to_string()))?;
        info!("intermediary listening on {}", addr);

        self.queue.clone().spawn_drain_loop(self.registries.clone());
        self.clone().spawn_metrics_loop();

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let broker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, broker).await {
                    warn!("intermediary connection from {} ended with error: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Logs connected-peer counts and queue depth on a fixed interval.
    /// In-memory only, no metrics backend — this is debug-level
    /// observability, not a monitoring surface.
    fn spawn_metrics_loop(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_INTERVAL);
            loop {
                ticker.tick().await;
                let integrations = self.registries.integration_count().await;
                let watchers = self.registries.watcher_count().await;
                let queue_depth = self.queue.depth().await;
                tracing::debug!(
                    integrations,
                    watchers,
                    queue_depth,
                    "broker heartbeat"
                );
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broker: std::sync::Arc<Broker>,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| BrokerError::Handshake(peer_addr, e.to_string()))?;
    let (mut sink, mut stream) = ws_stream.split();

    let first = match stream.next().await {
        Some(Ok(msg)) => msg,
        _ => return Err(anyhow!("{peer_addr} closed before registering")),
    };

    let text = match &first {
        Message::Text(t) => t.clone(),
        _ => {
            send_error(&mut sink, "registration frame must be JSON text").await;
            return Ok(());
        }
    };

    let frame: RegisterFrame = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(e) => {
            send_error(&mut sink, &format!("malformed registration frame: {e}")).await;
            return Ok(());
        }
    };

    if frame.auth_token != broker.auth_token {
        send_error(&mut sink, "invalid auth_token").await;
        return Ok(());
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let conn = PeerConn {
        name: frame.name.clone(),
        connected_at: SystemTime::now(),
        outbound_tx,
    };

    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let name = frame.name.clone();
    let connected_at = conn.connected_at;

    match frame.peer_type {
        PeerType::Integration => {
            broker.registries().upsert_integration(conn).await;
            broker
                .registries()
                .notify_watchers(&PeerConnectedEvent::integration(&name))
                .await;
            info!("integration '{}' registered from {}", name, peer_addr);
            if let Some(observer) = broker.lifecycle.get() {
                observer.on_integration_connected(&name);
            }

            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(msg) => {
                        if let Err(e) = handle_integration_frame(&broker, &name, msg).await {
                            warn!("error handling integration '{}' frame: {:?}", name, e);
                        }
                    }
                }
            }

            if broker.registries().remove_integration(&name, connected_at).await {
                broker
                    .registries()
                    .notify_watchers(&PeerDisconnectedEvent::integration(&name))
                    .await;
                info!("integration '{}' disconnected", name);
                if let Some(observer) = broker.lifecycle.get() {
                    observer.on_integration_disconnected(&name);
                }
            }
        }
        PeerType::Watcher => {
            broker.registries().upsert_watcher(conn).await;
            broker
                .registries()
                .notify_watchers(&PeerConnectedEvent::watcher(&name))
                .await;
            info!("watcher '{}' registered from {}", name, peer_addr);

            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(msg) => {
                        if let Err(e) = handle_watcher_frame(&broker, &name, msg).await {
                            warn!("error handling watcher '{}' frame: {:?}", name, e);
                        }
                    }
                }
            }

            if broker.registries().remove_watcher(&name, connected_at).await {
                broker
                    .registries()
                    .notify_watchers(&PeerDisconnectedEvent::watcher(&name))
                    .await;
                info!("watcher '{}' disconnected", name);
            }
        }
    }

    Ok(())
}

async fn handle_integration_frame(broker: &Broker, name: &str, msg: Message) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let payload: Value = serde_json::from_str(&text)
                .unwrap_or_else(|_| serde_json::to_value(RawTextAction::new(text)).unwrap());

            broker
                .registries()
                .notify_watchers(&IntegrationMessageEvent::new(name, payload.clone()))
                .await;

            if let Some(forwarder) = broker.forwarder.get() {
                let reply = match forwarder.forward(name, payload).await {
                    Ok(result) => serde_json::json!({ "result": result }),
                    Err(e) => {
                        warn!("forwarder failed for integration '{}': {:?}", name, e);
                        serde_json::to_value(protocol::ForwardFailed::default())?
                    }
                };
                broker.registries().send_to_integration(name, &reply).await;
            }
        }
        Message::Binary(bytes) => {
            let file = format!("upload_{name}.bin");
            tokio::fs::write(&file, &bytes)
                .await
                .map_err(|e| anyhow!("failed to write upload for '{name}': {e}"))?;
            broker
                .registries()
                .notify_watchers(&BinaryReceivedEvent::new(name, bytes.len(), file))
                .await;
        }
        _ => {}
    }
    Ok(())
}

async fn handle_watcher_frame(broker: &Broker, watcher_name: &str, msg: Message) -> Result<()> {
    let text = match msg {
        Message::Text(t) => t,
        _ => return Ok(()),
    };

    let frame: WatcherCommandFrame = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(_) => {
            broker
                .registries()
                .send_to_watcher(watcher_name, &ErrorReply::new("invalid target/cmd"))
                .await;
            return Ok(());
        }
    };

    let delivered = broker
        .registries()
        .send_to_integration(
            &frame.target,
            &WatcherToIntegration {
                from_watcher: watcher_name.to_string(),
                cmd: frame.cmd,
            },
        )
        .await;

    if delivered {
        broker
            .registries()
            .send_to_watcher(watcher_name, &SentReply::default())
            .await;
    } else {
        broker
            .registries()
            .send_to_watcher(watcher_name, &ErrorReply::new("invalid target/cmd"))
            .await;
    }

    Ok(())
}

async fn send_error<S>(sink: &mut S, reason: &str)
where
    S: futures::Sink<Message> + Unpin,
{
    let reply = ErrorReply::new(reason);
    if let Ok(text) = serde_json::to_string(&reply) {
        let _ = sink.send(Message::Text(text)).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Convenience wrapper matching the broker's `register`/`unregister`
/// action-registry operations named in the component design.
pub async fn register_action(broker: &Broker, schema: ActionSchema) {
    broker.registries().register_action(schema).await;
}

pub async fn unregister_action(broker: &Broker, integration_name: &str, action_name: &str) {
    broker
        .registries()
        .unregister_action(integration_name, action_name)
        .await;
}
