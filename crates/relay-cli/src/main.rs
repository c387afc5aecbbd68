// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::RelayConfig;
use relay_cli::intercept_proxy;
use tracing::info;

#[derive(Parser)]
#[command(name = "relay", version, about = "neuro-relay websocket broker")]
struct Cli {
    /// optional path to a relay.yaml config file (applies to all subcommands)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// run the intermediary broker and the backend adapter together
    Broker,

    /// run the standalone intercept proxy
    InterceptProxy,
}

#[tokio::main]
async fn main() -> Result<()> {
    util::logging::init_tracing();

    let cli = Cli::parse();
    let cfg = RelayConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Broker => run_broker(cfg).await,
        Commands::InterceptProxy => run_intercept_proxy(cfg).await,
    }
}

async fn run_broker(cfg: RelayConfig) -> Result<()> {
    let listen: SocketAddr = format!("{}:{}", cfg.intermediary.host, cfg.intermediary.port).parse()?;
    info!("starting broker on {}", listen);

    let broker = intermediary::Broker::new(cfg.intermediary.auth_token.clone(), cfg.intermediary.relay_queue.clone())?;

    let adapter_config = backend_adapter::Config {
        upstream_url: cfg.nakurity_client.ws_url(),
        game: "neuro-relay".to_string(),
    };
    let adapter_broker = broker.clone();
    tokio::spawn(async move {
        if let Err(e) = backend_adapter::run(adapter_config, adapter_broker).await {
            tracing::error!("backend adapter exited: {:?}", e);
        }
    });

    intermediary::run(broker, listen).await
}

async fn run_intercept_proxy(cfg: RelayConfig) -> Result<()> {
    let listen: SocketAddr = format!("{}:{}", cfg.intercept_proxy.host, cfg.intercept_proxy.port).parse()?;
    let intermediary_url = format!("ws://{}:{}", cfg.intermediary.host, cfg.intermediary.port);

    let config = intercept_proxy::InterceptConfig {
        listen,
        upstream_url: cfg.intercept_proxy.upstream_url.clone(),
        match_commands: cfg.intercept_proxy.match_commands.clone(),
        integration_name: cfg.intercept_proxy.integration_name.clone(),
        intermediary_url,
        auth_token: cfg.intermediary.auth_token.clone(),
    };

    intercept_proxy::run(config).await
}
