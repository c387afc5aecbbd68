// SPDX-License-Identifier: PolyForm-Shield-1.0

//! The forwarder hook the broker calls with every parsed integration text
//! payload. The backend adapter installs itself as the forwarder once at
//! startup; the broker never mutates it afterward.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, origin_integration: &str, payload: Value) -> Result<Value>;
}

/// Fired synchronously on integration connect/disconnect so the backend
/// adapter can mirror the event into the Linker without the broker knowing
/// anything about upstream translation. Installed the same way as a
/// [`Forwarder`], at most once.
pub trait LifecycleObserver: Send + Sync {
    fn on_integration_connected(&self, name: &str);
    fn on_integration_disconnected(&self, name: &str);
}
