// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Wire-format types shared by the broker, the backend adapter and the
//! intercept proxy. Everything here is plain serde data — no I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Small per-boundary error type for validation the serde layer can't
/// express on its own.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("forced-action choice has an empty selected action name")]
    EmptyChoiceSelection,
}

/// The two peer populations a socket can register as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    Integration,
    Watcher,
}

/// First frame a new peer must send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFrame {
    #[serde(rename = "type")]
    pub peer_type: PeerType,
    pub name: String,
    pub auth_token: String,
}

/// The `type` field of a [`RegisterFrame`]. `neuro-os` registers a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerType {
    #[serde(rename = "integration")]
    Integration,
    #[serde(rename = "neuro-os")]
    Watcher,
}

impl PeerType {
    pub fn kind(self) -> PeerKind {
        match self {
            PeerType::Integration => PeerKind::Integration,
            PeerType::Watcher => PeerKind::Watcher,
        }
    }
}

/// `{"error": ...}` — sent on registration failure, protocol errors, and
/// watcher commands with an unknown target.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReply {
    pub error: String,
}

impl ErrorReply {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            error: reason.into(),
        }
    }
}

/// Frame a watcher must send to command an integration.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherCommandFrame {
    pub target: String,
    pub cmd: Value,
}

/// `{"status": "sent"}` reply to a watcher after a successful command relay.
#[derive(Debug, Clone, Serialize)]
pub struct SentReply {
    pub status: &'static str,
}

impl Default for SentReply {
    fn default() -> Self {
        Self { status: "sent" }
    }
}

/// `{"from_watcher": ..., "cmd": ...}` delivered to the targeted integration.
#[derive(Debug, Clone, Serialize)]
pub struct WatcherToIntegration {
    pub from_watcher: String,
    pub cmd: Value,
}

/// Watcher notification emitted on a successful registration.
#[derive(Debug, Clone, Serialize)]
pub struct PeerConnectedEvent {
    pub event: &'static str,
    pub name: String,
}

impl PeerConnectedEvent {
    pub fn integration(name: impl Into<String>) -> Self {
        Self {
            event: "integration_connected",
            name: name.into(),
        }
    }

    pub fn watcher(name: impl Into<String>) -> Self {
        Self {
            event: "neuroos_connected",
            name: name.into(),
        }
    }
}

/// Watcher notification emitted when a peer disconnects.
#[derive(Debug, Clone, Serialize)]
pub struct PeerDisconnectedEvent {
    pub event: &'static str,
    pub name: String,
}

impl PeerDisconnectedEvent {
    pub fn integration(name: impl Into<String>) -> Self {
        Self {
            event: "integration_disconnected",
            name: name.into(),
        }
    }

    pub fn watcher(name: impl Into<String>) -> Self {
        Self {
            event: "neuroos_disconnected",
            name: name.into(),
        }
    }
}

/// Watcher notification mirroring every text payload from an integration,
/// sent before any translation or forwarding happens.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationMessageEvent {
    pub event: &'static str,
    pub from: String,
    pub payload: Value,
}

impl IntegrationMessageEvent {
    pub fn new(from: impl Into<String>, payload: Value) -> Self {
        Self {
            event: "integration_message",
            from: from.into(),
            payload,
        }
    }
}

/// Watcher notification summarizing an uploaded binary frame.
#[derive(Debug, Clone, Serialize)]
pub struct BinaryReceivedEvent {
    pub event: &'static str,
    pub from: String,
    pub size: usize,
    pub file: String,
}

impl BinaryReceivedEvent {
    pub fn new(from: impl Into<String>, size: usize, file: impl Into<String>) -> Self {
        Self {
            event: "binary_received",
            from: from.into(),
            size,
            file: file.into(),
        }
    }
}

/// A non-JSON text frame, wrapped so the rest of the pipeline can treat it
/// uniformly.
#[derive(Debug, Clone, Serialize)]
pub struct RawTextAction {
    pub action: &'static str,
    pub raw: String,
}

impl RawTextAction {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            action: "raw_text",
            raw: raw.into(),
        }
    }
}

/// Wraps the return value of an installed forwarder hook on its way back to
/// the originating integration.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardResult {
    pub result: Value,
}

/// Sent to the originating integration when a forwarder hook panics or
/// returns an error.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardFailed {
    pub error: &'static str,
}

impl Default for ForwardFailed {
    fn default() -> Self {
        Self {
            error: "relay->neuro forward failed",
        }
    }
}

/// `(integration_name, action_name)` is the primary key; survives across
/// reconnects of the same integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionSchema {
    pub integration_name: String,
    pub action_name: String,
    pub description: String,
    pub schema: Option<Value>,
}

/// An entry in the durable queue: a payload addressed to an integration
/// that was not connected at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub target_integration_name: String,
    pub payload: Value,
}

/// A unit of work for the Linker's translation queue.
#[derive(Debug, Clone)]
pub struct TrafficItem {
    pub id: Uuid,
    pub kind: TrafficKind,
    pub origin_integration: String,
    pub body: Value,
}

impl TrafficItem {
    pub fn new(kind: TrafficKind, origin_integration: impl Into<String>, body: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            origin_integration: origin_integration.into(),
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficKind {
    RegisterActions,
    Event,
}

/// Minimal `{name, description}` summary sent to integrations during a
/// forced-action request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSummary {
    pub name: String,
    pub description: String,
}

/// A correlation context for an in-flight `choose_force_action` call.
#[derive(Debug, Clone)]
pub struct ForcedActionRequest {
    pub game_title: String,
    pub state: Value,
    pub query: String,
    pub ephemeral_context: bool,
    pub actions: Vec<ActionSummary>,
}

/// The resolved outcome of a `choose_force_action` call, whether from a
/// reply or the timeout fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForcedActionReply {
    pub selected_action_name: String,
    pub data: String,
}

/// Raw `{"choice": {"selected": ..., "data": ...}}` payload accepted from
/// an integration socket.
#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceEnvelope {
    pub choice: ChoicePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoicePayload {
    pub selected: String,
    #[serde(default)]
    pub data: Value,
}

impl ChoicePayload {
    /// Rejects a choice whose `selected` name is blank, which would
    /// otherwise resolve a forced-action round with an unusable answer.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.selected.trim().is_empty() {
            return Err(ProtocolError::EmptyChoiceSelection);
        }
        Ok(())
    }
}

/// Payload broadcast to integrations (and, pre-notification, to watchers)
/// when a forced-action choice is requested.
#[derive(Debug, Clone, Serialize)]
pub struct ForcedActionBroadcastPayload {
    pub game_title: String,
    pub state: Value,
    pub query: String,
    pub ephemeral_context: bool,
    pub actions: Vec<ActionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChooseActionRequestEvent {
    pub event: &'static str,
    pub payload: ForcedActionBroadcastPayload,
}

impl ChooseActionRequestEvent {
    pub fn new(payload: ForcedActionBroadcastPayload) -> Self {
        Self {
            event: "choose_action_request",
            payload,
        }
    }
}

/// Watcher-only pre-notification sent before [`ChooseActionRequestEvent`]
/// is broadcast to integrations.
#[derive(Debug, Clone, Serialize)]
pub struct ChooseActionEvent {
    pub event: &'static str,
    pub payload: ForcedActionBroadcastPayload,
}

impl ChooseActionEvent {
    pub fn new(payload: ForcedActionBroadcastPayload) -> Self {
        Self {
            event: "choose_action",
            payload,
        }
    }
}

/// Fire-and-forget watcher notification for a passive context update from
/// the upstream that does not expect a reply.
#[derive(Debug, Clone, Serialize)]
pub struct AddContextEvent {
    pub event: &'static str,
    pub game_title: String,
    pub message: String,
    pub reply_if_not_busy: bool,
}

impl AddContextEvent {
    pub fn new(game_title: impl Into<String>, message: impl Into<String>, reply_if_not_busy: bool) -> Self {
        Self {
            event: "add_context",
            game_title: game_title.into(),
            message: message.into(),
            reply_if_not_busy,
        }
    }
}

/// An outbound command envelope sent to the upstream backend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command")]
pub enum UpstreamCommand {
    #[serde(rename = "startup")]
    Startup { data: Value },
    #[serde(rename = "context")]
    Context { game: String, data: ContextData },
    #[serde(rename = "actions/register")]
    ActionsRegister {
        game: String,
        data: ActionsRegisterData,
    },
    #[serde(rename = "actions/force")]
    ActionsForce { data: ActionsForceData },
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextData {
    pub message: String,
    pub silent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionsRegisterData {
    pub actions: Vec<RegisteredActionEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredActionEntry {
    pub name: String,
    pub description: String,
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionsForceData {
    pub state: String,
    pub query: String,
    pub action_names: Vec<String>,
    pub ephemeral_context: bool,
}

/// One-shot command the adapter sends right after startup/action
/// registration, listing the currently-connected integrations.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentContextCommand {
    pub op: &'static str,
    pub relay_name: String,
    pub relay_description: String,
    pub connected_integrations: Vec<String>,
}

impl EnvironmentContextCommand {
    pub fn new(
        relay_name: impl Into<String>,
        relay_description: impl Into<String>,
        connected_integrations: Vec<String>,
    ) -> Self {
        Self {
            op: "environment_context",
            relay_name: relay_name.into(),
            relay_description: relay_description.into(),
            connected_integrations,
        }
    }
}

/// Inbound frame from the upstream: `{name, data (JSON string), id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionMessage {
    pub name: String,
    pub data: String,
    pub id: String,
}

/// What the backend adapter hands to the Intermediary's installed
/// forwarder after receiving an [`ActionMessage`].
#[derive(Debug, Clone, Serialize)]
pub struct IntermediaryForwardPayload {
    pub from_neuro_backend: bool,
    pub action: String,
    pub data: Value,
    pub id: String,
}

impl IntermediaryForwardPayload {
    pub fn new(action: impl Into<String>, data: Value, id: impl Into<String>) -> Self {
        Self {
            from_neuro_backend: true,
            action: action.into(),
            data,
            id: id.into(),
        }
    }
}

/// Side-channel notification the intercept proxy registers with the
/// Intermediary as an ordinary integration message.
#[derive(Debug, Clone, Serialize)]
pub struct InterceptObservationEvent {
    pub event: &'static str,
    pub via: &'static str,
    pub details: InterceptObservationDetails,
}

impl InterceptObservationEvent {
    pub fn connected(details: InterceptObservationDetails) -> Self {
        Self {
            event: "integration_connected",
            via: "intercept-proxy",
            details,
        }
    }

    pub fn disconnected(details: InterceptObservationDetails) -> Self {
        Self {
            event: "integration_disconnected",
            via: "intercept-proxy",
            details,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InterceptObservationDetails {
    pub client: String,
    pub first_command: Option<String>,
    pub snippet: Option<String>,
}

/// `POST /auth` request to the external identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub module_name: String,
}

/// `POST /auth` response from the external identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub auth_token: String,
}

/// `POST /identify` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyRequest {
    pub module_name: String,
    pub auth_token: String,
    pub identity: Value,
}

/// `POST /nakurity/identify` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NakurityIdentifyRequest {
    pub identity: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_parses_neuro_os_as_watcher() {
        let json = r#"{"type":"neuro-os","name":"ops","auth_token":"t"}"#;
        let frame: RegisterFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.peer_type.kind(), PeerKind::Watcher);
    }

    #[test]
    fn actions_force_envelope_has_no_game_field() {
        let cmd = UpstreamCommand::ActionsForce {
            data: ActionsForceData {
                state: "{}".to_string(),
                query: "pick one".to_string(),
                action_names: vec!["A".to_string()],
                ephemeral_context: false,
            },
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["command"], "actions/force");
        assert!(value.get("game").is_none());
    }

    #[test]
    fn blank_choice_selection_is_rejected() {
        let choice = ChoicePayload {
            selected: "   ".to_string(),
            data: Value::Null,
        };
        assert!(matches!(
            choice.validate(),
            Err(ProtocolError::EmptyChoiceSelection)
        ));
    }
}
