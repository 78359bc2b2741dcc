use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use thiserror::Error;
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dto::{format_system_time, validation::validate_display_name},
    state::{
        matches::{Match, Team},
        registry::{Connection, ConnectionKind, Role, Scene},
    },
};

/// Messages accepted from any WebSocket client; the role gate lives in the hub.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "login")]
    Login(LoginRequest),
    #[serde(rename = "login:path")]
    LoginPath(LoginPathRequest),
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "relay:assign")]
    RelayAssign(AssignRequest),
    #[serde(rename = "relay:deactivate")]
    RelayDeactivate(DeactivateRequest),
    #[serde(rename = "match:get")]
    MatchGet(MatchGetRequest),
    #[serde(rename = "match:get_all")]
    MatchGetAll,
    #[serde(rename = "match:update")]
    MatchUpdate(MatchUpdateRequest),
    #[serde(rename = "match:set_team")]
    MatchSetTeam(SetTeamRequest),
    #[serde(rename = "group:list")]
    GroupList,
    #[serde(rename = "connection:list")]
    ConnectionList,
    #[serde(rename = "scene:register")]
    SceneRegister(SceneRegistration),
    #[serde(rename = "scene:visibility")]
    SceneVisibility(SceneCommand),
    #[serde(rename = "scene:update_data")]
    SceneUpdateData(SceneCommand),
    #[serde(rename = "scene:execute")]
    SceneExecute(SceneCommand),
    /// JSON-encoded telemetry string, as emitted by the game plugin.
    #[serde(rename = "game:event")]
    GameEvent(String),
}

/// Inbound frame: a [`ClientMessage`] plus the optional acknowledgement id.
#[derive(Debug)]
pub struct InboundFrame {
    pub ack: Option<u64>,
    pub message: ClientMessage,
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct FrameError {
    /// Acknowledgement id recovered from the frame, when present.
    pub ack: Option<u64>,
    pub reason: String,
}

impl InboundFrame {
    /// Decode a text frame of the form `{"event": .., "data": .., "ack": ..}`.
    pub fn from_json_str(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|err| FrameError {
            ack: None,
            reason: format!("malformed JSON: {err}"),
        })?;
        let Value::Object(mut object) = value else {
            return Err(FrameError {
                ack: None,
                reason: "frame must be a JSON object".into(),
            });
        };

        let ack = object.remove("ack").and_then(|ack| ack.as_u64());
        if object.get("data").is_some_and(Value::is_null) {
            object.remove("data");
        }

        let message =
            serde_json::from_value::<ClientMessage>(Value::Object(object)).map_err(|err| {
                FrameError {
                    ack,
                    reason: format!("invalid message: {err}"),
                }
            })?;
        Ok(Self { ack, message })
    }
}

/// Token login submitted over the socket.
#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "token must not be empty"))]
    pub token: String,
    pub role: Role,
    #[serde(default)]
    #[validate(custom(function = "validate_display_name"))]
    pub name: String,
}

/// Request for a one-time HTTP login path.
#[derive(Debug, Deserialize)]
pub struct LoginPathRequest {
    pub role: Role,
}

/// Route a connection to a group.
#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub id: String,
    pub group_id: String,
}

/// Force-disconnect a connection.
#[derive(Debug, Deserialize)]
pub struct DeactivateRequest {
    pub id: String,
}

/// Match lookup; without a group id the caller's own group is used.
#[derive(Debug, Deserialize)]
pub struct MatchGetRequest {
    #[serde(default)]
    pub group_id: Option<String>,
}

/// Partial match merged by operators; `null` values delete keys.
#[derive(Debug, Deserialize)]
pub struct MatchUpdateRequest {
    pub group_id: String,
    #[serde(rename = "match")]
    pub data: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct SetTeamRequest {
    pub group_id: String,
    /// Signed so out-of-range negative indexes reach the bounds check.
    pub index: i64,
    pub team: Map<String, Value>,
}

/// Scene an overlay declares it can render.
#[derive(Debug, Deserialize, Validate)]
pub struct SceneRegistration {
    #[validate(length(min = 1, message = "scene name must not be empty"))]
    pub name: String,
    #[serde(default, rename = "dataFormat")]
    pub data_format: Value,
    #[serde(default)]
    pub buttons: Vec<Value>,
}

/// Control-board scene command relayed verbatim to a group's overlays.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SceneCommand {
    pub group_id: String,
    pub scene: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Everything the hub pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "ack")]
    Ack(AckPayload),
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "logged_in")]
    LoggedIn(LoggedIn),
    #[serde(rename = "overlay:activated")]
    OverlayActivated(Vec<ConnectionSummary>),
    #[serde(rename = "plugin:activated")]
    PluginActivated(Vec<ConnectionSummary>),
    #[serde(rename = "controlboard:activated")]
    ControlBoardActivated(Vec<ConnectionSummary>),
    #[serde(rename = "overlay:deactivated")]
    OverlayDeactivated(ConnectionRef),
    #[serde(rename = "plugin:deactivated")]
    PluginDeactivated(ConnectionRef),
    #[serde(rename = "controlboard:deactivated")]
    ControlBoardDeactivated(ConnectionRef),
    #[serde(rename = "relay:assigned")]
    RelayAssigned(Assignment),
    #[serde(rename = "match:updated")]
    MatchUpdated(MatchUpdated),
    #[serde(rename = "match:team_set")]
    MatchTeamSet(TeamSet),
    /// Raw telemetry relayed verbatim.
    #[serde(rename = "game:event")]
    GameEvent(Value),
    #[serde(rename = "match:update_state")]
    MatchUpdateState(Match),
    #[serde(rename = "game:ended")]
    GameEnded(GameEnded),
    #[serde(rename = "match:ended")]
    MatchEnded(Match),
    #[serde(rename = "scene:visibility")]
    SceneVisibility(SceneCommand),
    #[serde(rename = "scene:update_data")]
    SceneUpdateData(SceneCommand),
    #[serde(rename = "scene:execute")]
    SceneExecute(SceneCommand),
}

impl ServerMessage {
    /// Push announcing the current list of connections for `role`.
    pub fn activated(role: Role, connections: Vec<ConnectionSummary>) -> Self {
        match role {
            Role::Overlay => ServerMessage::OverlayActivated(connections),
            Role::Plugin => ServerMessage::PluginActivated(connections),
            Role::ControlBoard => ServerMessage::ControlBoardActivated(connections),
        }
    }

    /// Push announcing that a connection of `role` went away.
    pub fn deactivated(role: Role, id: String) -> Self {
        let reference = ConnectionRef { id };
        match role {
            Role::Overlay => ServerMessage::OverlayDeactivated(reference),
            Role::Plugin => ServerMessage::PluginDeactivated(reference),
            Role::ControlBoard => ServerMessage::ControlBoardDeactivated(reference),
        }
    }
}

/// Answer to an inbound frame that carried an `ack` id.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct AckPayload {
    pub id: u64,
    pub ok: bool,
    pub data: Option<Value>,
    pub error: Option<ErrorBody>,
}

/// Machine-readable error returned in acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// Static metadata about the running hub.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub author: String,
}

impl ServerInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            author: env!("CARGO_PKG_AUTHORS").to_string(),
        }
    }
}

/// Pushed to a connection once its login completes.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedIn {
    pub id: String,
    pub role: Role,
    pub identity: crate::services::auth::Identity,
    pub server: ServerInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub id: String,
    pub group_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchUpdated {
    pub group_id: String,
    #[serde(rename = "match")]
    pub record: Match,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamSet {
    pub group_id: String,
    pub index: usize,
    pub team: Team,
}

#[derive(Debug, Clone, Serialize)]
pub struct GameEnded {
    #[serde(rename = "match")]
    pub record: Match,
    pub winner_team: usize,
}

/// Group overview for control boards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub group_id: String,
    pub overlays: usize,
    pub plugins: usize,
    pub has_match: bool,
}

/// Operator-facing view of a registry entry.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: String,
    pub role: Role,
    pub email: String,
    pub name: String,
    #[serde(rename = "group_id")]
    pub group_id: String,
    pub connected_at: String,
    pub scenes: Option<Vec<Scene>>,
    pub rate: Option<u32>,
    pub input_count: Option<u64>,
    pub active: Option<bool>,
    #[serde(rename = "ingame_match_guid")]
    pub ingame_match_guid: Option<String>,
}

impl From<&Connection> for ConnectionSummary {
    fn from(connection: &Connection) -> Self {
        let mut summary = Self {
            id: connection.id.clone(),
            role: connection.role(),
            email: connection.identity.email.clone(),
            name: connection.name.clone(),
            group_id: connection.group_id.clone(),
            connected_at: format_system_time(connection.connected_at),
            scenes: None,
            rate: None,
            input_count: None,
            active: None,
            ingame_match_guid: None,
        };
        match &connection.kind {
            ConnectionKind::Overlay(overlay) => summary.scenes = Some(overlay.scenes.clone()),
            ConnectionKind::Plugin(plugin) => {
                summary.rate = Some(plugin.rate);
                summary.input_count = Some(plugin.input_count);
                summary.active = Some(plugin.active);
                summary.ingame_match_guid = Some(plugin.ingame_match_guid.clone());
            }
            ConnectionKind::ControlBoard => {}
        }
        summary
    }
}
