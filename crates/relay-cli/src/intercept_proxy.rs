// SPDX-License-Identifier: PolyForm-Shield-1.0

//! The intercept proxy: a transparent WS-to-WS pass-through that watches a
//! client→upstream stream for recognized commands and mirrors them into the
//! Intermediary as side-channel observations. It registers with the
//! Intermediary as an ordinary integration so the broker never needs a
//! special case for it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use protocol::{InterceptObservationDetails, InterceptObservationEvent, PeerType, RegisterFrame};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct InterceptConfig {
    pub listen: SocketAddr,
    pub upstream_url: String,
    pub match_commands: Vec<String>,
    pub integration_name: String,
    pub intermediary_url: String,
    pub auth_token: String,
}

type NotifyTx = Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>;

pub async fn run(config: InterceptConfig) -> Result<()> {
    let config = Arc::new(config);
    let notify_tx: NotifyTx = Arc::new(RwLock::new(None));

    tokio::spawn(maintain_intermediary_connection(config.clone(), notify_tx.clone()));

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|e| anyhow!("failed to bind intercept proxy on {}: {e}", config.listen))?;
    info!("intercept proxy listening on {}", config.listen);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let config = config.clone();
        let notify_tx = notify_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer_addr, config, notify_tx).await {
                warn!("intercept proxy client {} ended with error: {:?}", peer_addr, e);
            }
        });
    }
}

/// Keep a registered integration connection to the Intermediary alive,
/// reconnecting on a fixed 2s delay. The send half is shared with every
/// client-handling task so observations can be emitted as they occur.
async fn maintain_intermediary_connection(config: Arc<InterceptConfig>, notify_tx: NotifyTx) {
    loop {
        match connect_async(&config.intermediary_url).await {
            Ok((ws_stream, _)) => {
                let (mut sink, mut stream) = ws_stream.split();

                let register = RegisterFrame {
                    peer_type: PeerType::Integration,
                    name: config.integration_name.clone(),
                    auth_token: config.auth_token.clone(),
                };
                if let Ok(text) = serde_json::to_string(&register) {
                    if sink.send(Message::Text(text)).await.is_err() {
                        time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }

                let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                *notify_tx.write().await = Some(tx);
                info!("intercept proxy registered with intermediary at {}", config.intermediary_url);

                let writer = tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                });

                while stream.next().await.is_some() {
                    // the intermediary never commands the intercept proxy directly; drain and discard.
                }

                writer.abort();
            }
            Err(e) => {
                warn!("intercept proxy could not reach intermediary: {:?}", e);
            }
        }

        *notify_tx.write().await = None;
        time::sleep(RECONNECT_DELAY).await;
    }
}

async fn emit(notify_tx: &NotifyTx, event: &impl serde::Serialize) {
    let guard = notify_tx.read().await;
    if let Some(tx) = guard.as_ref() {
        if let Ok(text) = serde_json::to_string(event) {
            let _ = tx.send(Message::Text(text));
        }
    }
}

async fn handle_client(
    client: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<InterceptConfig>,
    notify_tx: NotifyTx,
) -> Result<()> {
    let client_ws = accept_async(client)
        .await
        .map_err(|e| anyhow!("failed to upgrade intercept client {peer_addr}: {e}"))?;
    let (mut client_sink, mut client_stream) = client_ws.split();

    let (upstream_ws, _) = connect_async(&config.upstream_url)
        .await
        .map_err(|e| anyhow!("intercept proxy could not reach upstream {}: {e}", config.upstream_url))?;
    let (mut upstream_sink, mut upstream_stream) = upstream_ws.split();

    let mut details = InterceptObservationDetails {
        client: peer_addr.to_string(),
        first_command: None,
        snippet: None,
    };

    loop {
        tokio::select! {
            msg = client_stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        if let Message::Text(text) = &msg {
                            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                                if let Some(command) = parsed.get("command").and_then(Value::as_str) {
                                    if config.match_commands.iter().any(|c| c == command) {
                                        details.first_command.get_or_insert_with(|| command.to_string());
                                        details.snippet = Some(text.chars().take(200).collect());
                                        emit(&notify_tx, &InterceptObservationEvent::connected(details.clone())).await;
                                    }
                                }
                            }
                        }
                        if upstream_sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("intercept proxy client read error from {}: {:?}", peer_addr, e);
                        break;
                    }
                }
            }
            msg = upstream_stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        if client_sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("intercept proxy upstream read error for {}: {:?}", peer_addr, e);
                        break;
                    }
                }
            }
        }
    }

    let _ = client_sink.send(Message::Close(None)).await;
    let _ = upstream_sink.send(Message::Close(None)).await;
    emit(&notify_tx, &InterceptObservationEvent::disconnected(details)).await;

    Ok(())
}
