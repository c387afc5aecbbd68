// SPDX-License-Identifier: PolyForm-Shield-1.0

use thiserror::Error;

/// Errors raised sending to (or while not holding) the upstream websocket.
/// Connect/reconnect failures stay inside `connect_loop`'s retry logic and
/// are logged there rather than surfaced through this type.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream websocket is not connected")]
    NotConnected,

    #[error("failed to send frame to upstream websocket: {0}")]
    SendFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_has_a_stable_message() {
        assert_eq!(
            AdapterError::NotConnected.to_string(),
            "upstream websocket is not connected"
        );
    }
}
