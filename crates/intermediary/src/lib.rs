// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

pub mod broker;
pub mod error;
pub mod forward;
pub mod queue_drain;
pub mod registry;
pub mod shutdown;

pub use broker::Broker;
pub use error::BrokerError;
pub use forward::{Forwarder, LifecycleObserver};

pub struct Config {
    pub listen: SocketAddr,
    pub auth_token: String,
    pub relay_queue: PathBuf,
}

/// Build the broker and run it until shutdown. Returns the broker handle
/// so callers (the `relay-cli` binary) can install a forwarder and share
/// registries with the backend adapter before traffic starts flowing.
pub async fn build(config: Config) -> Result<Arc<Broker>> {
    Broker::new(config.auth_token, config.relay_queue)
}

pub async fn run(broker: Arc<Broker>, listen: SocketAddr) -> Result<()> {
    info!("starting intermediary broker on {}", listen);
    let server = broker.clone().start(listen);

    tokio::select! {
        res = server => res,
        _ = shutdown::wait_for_signal() => {
            info!("intermediary shutting down");
            Ok(())
        }
    }
}
