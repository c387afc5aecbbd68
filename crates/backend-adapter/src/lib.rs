// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::sync::Arc;

use anyhow::Result;
use intermediary::Broker;
use tracing::info;

pub mod adapter;
pub mod error;
pub mod linker;

pub use adapter::BackendAdapter;
pub use error::AdapterError;

#[derive(Clone)]
pub struct Config {
    pub upstream_url: String,
    pub game: String,
}

/// Build the adapter and install it into `broker` as both the forwarder and
/// the lifecycle observer, then hand back a future that drives the upstream
/// connection and the Linker drain loop until shutdown.
pub async fn run(config: Config, broker: Arc<Broker>) -> Result<()> {
    info!(
        "starting backend adapter for upstream {} (game={})",
        config.upstream_url, config.game
    );

    let (adapter, linker_rx) = BackendAdapter::new(broker.clone(), config.upstream_url, config.game);

    broker.install_forwarder(adapter.clone());
    broker.install_lifecycle_observer(adapter.clone());

    adapter.run(linker_rx).await;
    Ok(())
}
