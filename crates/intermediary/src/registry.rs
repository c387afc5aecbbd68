// SPDX-License-Identifier: PolyForm-Shield-1.0

//! In-memory registries: integrations-by-name, watchers-by-name, and
//! action-schema-by-`(integration, action)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use protocol::ActionSchema;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// A registered peer's send handle. The writer task draining this channel
/// owns the live websocket sink; dropping the sender causes that task to
/// close the socket.
pub type OutboundTx = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone)]
pub struct PeerConn {
    pub name: String,
    pub connected_at: SystemTime,
    pub outbound_tx: OutboundTx,
}

impl PeerConn {
    fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.outbound_tx.send(Message::Text(text)).is_ok(),
            Err(e) => {
                warn!("failed to serialize message for peer {}: {:?}", self.name, e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registries {
    integrations: Arc<RwLock<HashMap<String, PeerConn>>>,
    watchers: Arc<RwLock<HashMap<String, PeerConn>>>,
    actions: Arc<RwLock<HashMap<(String, String), ActionSchema>>>,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an integration, closing out any prior connection under the
    /// same name (last-writer-wins).
    pub async fn upsert_integration(&self, conn: PeerConn) {
        let mut integrations = self.integrations.write().await;
        if let Some(previous) = integrations.insert(conn.name.clone(), conn) {
            let _ = previous.outbound_tx.send(Message::Close(None));
        }
    }

    pub async fn upsert_watcher(&self, conn: PeerConn) {
        let mut watchers = self.watchers.write().await;
        if let Some(previous) = watchers.insert(conn.name.clone(), conn) {
            let _ = previous.outbound_tx.send(Message::Close(None));
        }
    }

    /// Remove an integration only if it is still the connection identified
    /// by `conn_at` — a reconnect under the same name must not be removed
    /// by the old connection's disconnect handler racing behind it.
    pub async fn remove_integration(&self, name: &str, conn_at: SystemTime) -> bool {
        let mut integrations = self.integrations.write().await;
        if integrations.get(name).map(|c| c.connected_at) == Some(conn_at) {
            integrations.remove(name);
            return true;
        }
        false
    }

    pub async fn remove_watcher(&self, name: &str, conn_at: SystemTime) -> bool {
        let mut watchers = self.watchers.write().await;
        if watchers.get(name).map(|c| c.connected_at) == Some(conn_at) {
            watchers.remove(name);
            return true;
        }
        false
    }

    pub async fn is_integration_connected(&self, name: &str) -> bool {
        self.integrations.read().await.contains_key(name)
    }

    pub async fn connected_integration_names(&self) -> Vec<String> {
        self.integrations.read().await.keys().cloned().collect()
    }

    pub async fn integration_count(&self) -> usize {
        self.integrations.read().await.len()
    }

    pub async fn watcher_count(&self) -> usize {
        self.watchers.read().await.len()
    }

    /// Send `value` to the named integration if connected; returns whether
    /// delivery was attempted successfully.
    pub async fn send_to_integration<T: Serialize>(&self, target: &str, value: &T) -> bool {
        let integrations = self.integrations.read().await;
        match integrations.get(target) {
            Some(conn) => conn.send_json(value),
            None => false,
        }
    }

    pub async fn send_to_watcher<T: Serialize>(&self, target: &str, value: &T) -> bool {
        let watchers = self.watchers.read().await;
        match watchers.get(target) {
            Some(conn) => conn.send_json(value),
            None => false,
        }
    }

    /// Broadcast to every watcher. A send failure drops that watcher from
    /// the registry; there is no retry.
    pub async fn notify_watchers<T: Serialize>(&self, value: &T) {
        let stale: Vec<String> = {
            let watchers = self.watchers.read().await;
            watchers
                .iter()
                .filter(|(_, conn)| !conn.send_json(value))
                .map(|(name, _)| name.clone())
                .collect()
        };
        if !stale.is_empty() {
            let mut watchers = self.watchers.write().await;
            for name in stale {
                watchers.remove(&name);
            }
        }
    }

    /// Broadcast to every currently-connected integration.
    pub async fn broadcast_to_integrations<T: Serialize>(&self, value: &T) {
        let stale: Vec<String> = {
            let integrations = self.integrations.read().await;
            integrations
                .iter()
                .filter(|(_, conn)| !conn.send_json(value))
                .map(|(name, _)| name.clone())
                .collect()
        };
        if !stale.is_empty() {
            let mut integrations = self.integrations.write().await;
            for name in stale {
                integrations.remove(&name);
            }
        }
    }

    pub async fn register_action(&self, schema: ActionSchema) {
        let key = (schema.integration_name.clone(), schema.action_name.clone());
        self.actions.write().await.insert(key, schema);
    }

    pub async fn unregister_action(&self, integration_name: &str, action_name: &str) {
        self.actions
            .write()
            .await
            .remove(&(integration_name.to_string(), action_name.to_string()));
    }

    /// Flat map from `action_name` to schema, across all integrations.
    /// Action schemas are retained across integration disconnects; they
    /// are only removed by an explicit `unregister_action` call.
    pub async fn collect_all_actions(&self) -> HashMap<String, ActionSchema> {
        self.actions
            .read()
            .await
            .values()
            .map(|schema| (schema.action_name.clone(), schema.clone()))
            .collect()
    }

    pub async fn actions_for_integration(&self, integration_name: &str) -> Vec<ActionSchema> {
        self.actions
            .read()
            .await
            .values()
            .filter(|schema| schema.integration_name == integration_name)
            .cloned()
            .collect()
    }
}
