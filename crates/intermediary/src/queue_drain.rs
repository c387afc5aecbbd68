// SPDX-License-Identifier: PolyForm-Shield-1.0

//! The durable pending-delivery queue and its background drain loop.
//!
//! A single task owns mutation of the in-memory queue, preserving FIFO
//! delivery per target even though multiple connection handlers may call
//! [`PendingQueue::enqueue`] concurrently — the lock serializes writers,
//! and only the drain task ever removes entries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use protocol::PendingDelivery;
use queue::DurableQueue;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{info, warn};

use crate::registry::Registries;

const DRAIN_INTERVAL: Duration = Duration::from_secs(5);

pub struct PendingQueue {
    items: RwLock<Vec<PendingDelivery>>,
    disk: DurableQueue,
}

impl PendingQueue {
    /// Restore all records from disk before accepting connections.
    pub fn restore(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let disk = DurableQueue::new(path.into());
        let items = disk.load()?;
        info!("Restored {} queued messages.", items.len());
        Ok(Self {
            items: RwLock::new(items),
            disk,
        })
    }

    pub async fn depth(&self) -> usize {
        self.items.read().await.len()
    }

    /// Append a new delivery and persist immediately.
    pub async fn enqueue(&self, target: impl Into<String>, payload: Value) -> Result<()> {
        let mut items = self.items.write().await;
        items.push(PendingDelivery {
            target_integration_name: target.into(),
            payload,
        });
        if let Err(e) = self.disk.save(&items) {
            warn!("failed to persist durable queue after enqueue: {:?}", e);
        }
        Ok(())
    }

    /// Attempt one drain pass: deliver every head entry whose target is
    /// now connected, in order, re-enqueueing the rest.
    async fn drain_once(&self, registries: &Registries) {
        let mut items = self.items.write().await;
        if items.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut *items);
        let mut remaining = Vec::with_capacity(pending.len());
        let mut delivered = 0usize;

        for item in pending {
            let sent = registries
                .send_to_integration(&item.target_integration_name, &item.payload)
                .await;
            if sent {
                delivered += 1;
            } else {
                remaining.push(item);
            }
        }

        *items = remaining;

        if delivered > 0 {
            if let Err(e) = self.disk.save(&items) {
                warn!("failed to persist durable queue after drain: {:?}", e);
            }
            info!("drained {} queued message(s)", delivered);
        }
    }

    /// Spawn the single background drain task. Must only be called once
    /// per queue instance to preserve the single-drain-task FIFO guarantee.
    pub fn spawn_drain_loop(self: Arc<Self>, registries: Registries) {
        tokio::spawn(async move {
            loop {
                time::sleep(DRAIN_INTERVAL).await;
                self.drain_once(&registries).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerConn;
    use serde_json::json;
    use std::time::SystemTime;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn restores_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.bin");
        let disk = DurableQueue::new(&path);
        disk.save(&[
            PendingDelivery {
                target_integration_name: "zeta".into(),
                payload: json!(1),
            },
            PendingDelivery {
                target_integration_name: "zeta".into(),
                payload: json!(2),
            },
        ])
        .unwrap();

        let queue = PendingQueue::restore(&path).unwrap();
        assert_eq!(queue.depth().await, 2);
    }

    #[tokio::test]
    async fn drain_delivers_connected_targets_and_keeps_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.bin");
        let queue = PendingQueue::restore(&path).unwrap();
        queue.enqueue("beta", json!({"x": 1})).await.unwrap();
        queue.enqueue("gamma", json!({"x": 2})).await.unwrap();

        let registries = Registries::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registries
            .upsert_integration(PeerConn {
                name: "beta".into(),
                connected_at: SystemTime::now(),
                outbound_tx: tx,
            })
            .await;

        queue.drain_once(&registries).await;

        assert_eq!(queue.depth().await, 1);
        assert!(matches!(rx.recv().await, Some(Message::Text(_))));
    }
}
