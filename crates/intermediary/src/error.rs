// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised at the broker's own boundary (listener setup, the
/// websocket handshake). Per-frame protocol problems are reported to the
/// offending peer instead of propagated here.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind intermediary listener on {0}: {1}")]
    Bind(SocketAddr, String),

    #[error("failed to upgrade websocket connection from {0}: {1}")]
    Handshake(SocketAddr, String),
}
