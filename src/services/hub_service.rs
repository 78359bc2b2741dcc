//! Relay hub operations: login, group routing, telemetry ingestion, control-board commands
//! and disconnect handling.
//!
//! Every mutation happens under the registry/match locks; fan-out is queued on the transport
//! only after the guards are released.

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::{
    dto::{
        login::LoginForm,
        validation::normalize_group_name,
        ws::{
            AssignRequest, Assignment, ClientMessage, ConnectionSummary, GroupSummary, LoggedIn,
            LoginRequest, MatchUpdated, SceneCommand, SceneRegistration, ServerInfo, ServerMessage,
            TeamSet,
        },
    },
    error::ServiceError,
    services::{
        auth::{Credential, Identity},
        event_parser::{ParseOutcome, PluginContext, TelemetryEvent},
    },
    state::{
        SharedState,
        matches::{Match, Team},
        registry::{Connection, ConnectionRegistry, Role, is_assigned},
        rooms::{Transport, TransportExt, encode},
    },
};

/// Result of one inbound message: optional acknowledgement data or a typed failure.
pub type Reply = Result<Option<Value>, ServiceError>;

const CONTROL_ONLY: &[Role] = &[Role::ControlBoard];

/// Route a decoded client message to the matching hub operation.
pub async fn dispatch(state: &SharedState, connection_id: &str, message: ClientMessage) -> Reply {
    match message {
        ClientMessage::Login(request) => {
            let logged_in = login_with_token(state, connection_id, request).await?;
            Ok(reply(&logged_in))
        }
        ClientMessage::LoginPath(request) => {
            let path = request_login_path(state, connection_id, request.role).await?;
            Ok(Some(Value::String(path)))
        }
        ClientMessage::Heartbeat => Ok(None),
        ClientMessage::RelayAssign(request) => {
            let assignment = assign_group(state, connection_id, request).await?;
            Ok(reply(&assignment))
        }
        ClientMessage::RelayDeactivate(request) => {
            require_role(state, connection_id, CONTROL_ONLY, "relay:deactivate").await?;
            deactivate(state, &request.id).await?;
            Ok(None)
        }
        ClientMessage::MatchGet(request) => {
            let group_id = match request.group_id {
                Some(group_id) => group_id,
                None => own_group(state, connection_id).await?,
            };
            let record = get_match(state, &group_id).await?;
            Ok(reply(&record))
        }
        ClientMessage::MatchGetAll => Ok(reply(&list_matches(state).await)),
        ClientMessage::MatchUpdate(request) => {
            require_role(state, connection_id, CONTROL_ONLY, "match:update").await?;
            let record = update_match(state, &request.group_id, request.data).await?;
            Ok(reply(&record))
        }
        ClientMessage::MatchSetTeam(request) => {
            require_role(state, connection_id, CONTROL_ONLY, "match:set_team").await?;
            let team = set_team(state, &request.group_id, request.index, request.team).await?;
            Ok(reply(&team))
        }
        ClientMessage::GroupList => {
            require_role(state, connection_id, CONTROL_ONLY, "group:list").await?;
            Ok(reply(&list_groups(state).await))
        }
        ClientMessage::ConnectionList => {
            require_role(state, connection_id, CONTROL_ONLY, "connection:list").await?;
            Ok(reply(&list_connections(state).await))
        }
        ClientMessage::SceneRegister(registration) => {
            register_scene(state, connection_id, registration).await?;
            Ok(None)
        }
        ClientMessage::SceneVisibility(command) => {
            require_role(state, connection_id, CONTROL_ONLY, "scene:visibility").await?;
            relay_scene(state, SceneRelay::Visibility, command).await?;
            Ok(None)
        }
        ClientMessage::SceneUpdateData(command) => {
            require_role(state, connection_id, CONTROL_ONLY, "scene:update_data").await?;
            relay_scene(state, SceneRelay::UpdateData, command).await?;
            Ok(None)
        }
        ClientMessage::SceneExecute(command) => {
            require_role(state, connection_id, CONTROL_ONLY, "scene:execute").await?;
            relay_scene(state, SceneRelay::Execute, command).await?;
            Ok(None)
        }
        ClientMessage::GameEvent(raw) => {
            handle_telemetry(state, connection_id, &raw).await?;
            Ok(None)
        }
    }
}

fn reply<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value)
        .map_err(|err| warn!(error = %err, "failed to encode acknowledgement data"))
        .ok()
}

async fn require_role(
    state: &SharedState,
    connection_id: &str,
    allowed: &[Role],
    action: &str,
) -> Result<Role, ServiceError> {
    let role = state
        .connections()
        .read()
        .await
        .find(connection_id)
        .map(Connection::role)
        .ok_or_else(|| ServiceError::Forbidden(format!("login required for `{action}`")))?;
    if !allowed.contains(&role) {
        return Err(ServiceError::Forbidden(format!(
            "{role} connections may not use `{action}`"
        )));
    }
    Ok(role)
}

/// Group the caller is assigned to, for requests that omit one.
async fn own_group(state: &SharedState, connection_id: &str) -> Result<String, ServiceError> {
    state
        .connections()
        .read()
        .await
        .find(connection_id)
        .and_then(Connection::group)
        .map(str::to_string)
        .ok_or_else(|| {
            ServiceError::InvalidInput("group_id is required for unassigned connections".into())
        })
}

async fn ensure_pending(state: &SharedState, connection_id: &str) -> Result<(), ServiceError> {
    if state.connections().read().await.contains(connection_id) {
        return Err(ServiceError::AlreadyAuthenticated);
    }
    Ok(())
}

fn summaries(connections: &ConnectionRegistry, role: Role) -> Vec<ConnectionSummary> {
    connections
        .find_by_role(role)
        .into_iter()
        .map(ConnectionSummary::from)
        .collect()
}

/// Queue `message` for the control room and for the non-plugin members of `group_id`.
fn fan_out(state: &SharedState, group_id: &str, message: &ServerMessage) {
    let Some(frame) = encode(message) else {
        return;
    };
    let transport = state.transport();
    transport.broadcast_raw(Role::ControlBoard.room(), &[], frame.clone());
    if is_assigned(group_id) {
        transport.broadcast_raw(
            group_id,
            &[Role::Plugin.room(), Role::ControlBoard.room()],
            frame,
        );
    }
}

/// Verify a session token submitted over the socket, then log the connection in.
pub async fn login_with_token(
    state: &SharedState,
    connection_id: &str,
    request: LoginRequest,
) -> Result<LoggedIn, ServiceError> {
    ensure_pending(state, connection_id).await?;
    request.validate()?;

    let identity = state
        .authenticator()
        .authenticate(Credential::Token(request.token))
        .await
        .inspect_err(|err| warn!(id = %connection_id, error = %err, "token login rejected"))?;

    complete_login(state, connection_id, request.role, identity, request.name).await
}

/// Issue a one-time HTTP path the pending connection can log in through.
pub async fn request_login_path(
    state: &SharedState,
    connection_id: &str,
    role: Role,
) -> Result<String, ServiceError> {
    ensure_pending(state, connection_id).await?;
    if !state.transport().is_attached(connection_id) {
        return Err(ServiceError::ConnectionNotFound(connection_id.to_string()));
    }

    state.login_tickets().insert(connection_id.to_string(), role);
    info!(id = %connection_id, %role, "issued login path");
    Ok(format!("/login/{connection_id}"))
}

/// Role requested by a pending connection that holds a login ticket.
pub async fn login_ticket(state: &SharedState, connection_id: &str) -> Result<Role, ServiceError> {
    ensure_pending(state, connection_id).await?;
    state
        .login_tickets()
        .get(connection_id)
        .map(|entry| *entry.value())
        .ok_or_else(|| ServiceError::NotFound(format!("login ticket for `{connection_id}`")))
}

/// Redeem a login ticket with the credentials posted by the HTTP login form.
pub async fn redeem_login_ticket(
    state: &SharedState,
    connection_id: &str,
    form: LoginForm,
) -> Result<LoggedIn, ServiceError> {
    let role = login_ticket(state, connection_id).await?;
    let identity = state
        .authenticator()
        .authenticate(Credential::Password {
            email: form.email,
            password: form.password,
        })
        .await
        .inspect_err(|err| warn!(id = %connection_id, error = %err, "password login rejected"))?;

    complete_login(state, connection_id, role, identity, form.name).await
}

/// Register an authenticated connection; shared by the token and HTTP login flows.
pub async fn complete_login(
    state: &SharedState,
    connection_id: &str,
    role: Role,
    identity: Identity,
    name: String,
) -> Result<LoggedIn, ServiceError> {
    let name = match name.trim() {
        "" => identity.display_name.clone(),
        trimmed => trimmed.to_string(),
    };
    let connection = Connection::new(connection_id, role, identity.clone(), name);

    let peers = {
        let mut connections = state.connections().write().await;
        // Disconnect detaches before taking this lock, so the check cannot race it.
        if !state.transport().is_attached(connection_id) {
            return Err(ServiceError::ConnectionNotFound(connection_id.to_string()));
        }
        connections.add(connection)?;
        summaries(&connections, role)
    };
    state.login_tickets().remove(connection_id);

    let transport = state.transport();
    transport.join(connection_id, role.room());
    info!(id = %connection_id, %role, email = %identity.email, "connection logged in");

    let logged_in = LoggedIn {
        id: connection_id.to_string(),
        role,
        identity,
        server: ServerInfo::current(),
    };
    transport.send(connection_id, &ServerMessage::LoggedIn(logged_in.clone()));
    transport.broadcast(
        Role::ControlBoard.room(),
        &[],
        &ServerMessage::activated(role, peers),
    );

    if role.is_grouped() {
        if let Some(group) = state.config().default_group.clone() {
            if let Err(err) = assign_connection(state, connection_id, &group).await {
                warn!(id = %connection_id, group = %group, error = %err, "default group assignment failed");
            }
        }
    }

    Ok(logged_in)
}

/// Handle `relay:assign`: overlays and plugins route themselves, control boards route anyone.
pub async fn assign_group(
    state: &SharedState,
    caller_id: &str,
    request: AssignRequest,
) -> Result<Assignment, ServiceError> {
    let group = normalize_group_name(&request.group_id)
        .ok_or(ServiceError::InvalidGroupName)?
        .to_string();

    let role = require_role(
        state,
        caller_id,
        &[Role::Overlay, Role::Plugin, Role::ControlBoard],
        "relay:assign",
    )
    .await?;
    if role != Role::ControlBoard && request.id != caller_id {
        return Err(ServiceError::Forbidden(format!(
            "{role} connections may only assign themselves"
        )));
    }

    assign_connection(state, &request.id, &group).await
}

/// Move a connection to `group`, lazily creating the match when a plugin joins it.
pub async fn assign_connection(
    state: &SharedState,
    connection_id: &str,
    group: &str,
) -> Result<Assignment, ServiceError> {
    let (role, previous, peers) = {
        let mut connections = state.connections().write().await;
        let connection = connections
            .find_mut(connection_id)
            .ok_or_else(|| ServiceError::ConnectionNotFound(connection_id.to_string()))?;
        let role = connection.role();
        if !role.is_grouped() {
            return Err(ServiceError::InvalidInput(
                "control boards are not assigned to groups".into(),
            ));
        }
        let previous = std::mem::replace(&mut connection.group_id, group.to_string());

        if role == Role::Plugin && is_assigned(group) {
            let mut matches = state.matches().write().await;
            if !matches.contains(group) {
                matches.get_or_create(group);
                info!(group = %group, "created match");
            }
        }
        (role, previous, summaries(&connections, role))
    };

    let transport = state.transport();
    if is_assigned(&previous) && previous != group {
        transport.leave(connection_id, &previous);
    }
    if is_assigned(group) {
        transport.join(connection_id, group);
    }
    info!(id = %connection_id, %role, from = %previous, to = %group, "connection assigned");

    let assignment = Assignment {
        id: connection_id.to_string(),
        group_id: group.to_string(),
    };
    let message = ServerMessage::RelayAssigned(assignment.clone());
    transport.send(connection_id, &message);
    transport.broadcast(Role::ControlBoard.room(), &[], &message);
    transport.broadcast(
        Role::ControlBoard.room(),
        &[],
        &ServerMessage::activated(role, peers),
    );

    if role == Role::Overlay && is_assigned(group) {
        replay_scene_cache(state, connection_id, None).await;
    }
    Ok(assignment)
}

/// Force-disconnect a connection on behalf of a control board.
pub async fn deactivate(state: &SharedState, target_id: &str) -> Result<(), ServiceError> {
    let role = state
        .connections()
        .read()
        .await
        .find(target_id)
        .map(Connection::role);
    match role {
        Some(Role::ControlBoard) => {
            return Err(ServiceError::Forbidden(
                "control boards cannot be deactivated".into(),
            ));
        }
        Some(_) => {}
        None if state.transport().is_attached(target_id) => {}
        None => return Err(ServiceError::ConnectionNotFound(target_id.to_string())),
    }

    info!(id = %target_id, ?role, "deactivating connection");
    state.transport().disconnect(target_id);
    on_disconnect(state, target_id).await;
    Ok(())
}

pub async fn get_match(state: &SharedState, group_id: &str) -> Result<Match, ServiceError> {
    state
        .matches()
        .read()
        .await
        .get(group_id)
        .cloned()
        .ok_or_else(|| ServiceError::NotFound(format!("match `{group_id}`")))
}

pub async fn list_matches(state: &SharedState) -> Vec<Match> {
    state.matches().read().await.list()
}

/// Merge operator fields into a match and echo the result.
pub async fn update_match(
    state: &SharedState,
    group_id: &str,
    partial: Map<String, Value>,
) -> Result<Match, ServiceError> {
    let record = state.matches().write().await.update(group_id, partial)?;
    info!(group = %group_id, "match updated");

    fan_out(
        state,
        group_id,
        &ServerMessage::MatchUpdated(MatchUpdated {
            group_id: group_id.to_string(),
            record: record.clone(),
        }),
    );
    Ok(record)
}

/// Merge operator fields into one team and echo the result.
pub async fn set_team(
    state: &SharedState,
    group_id: &str,
    index: i64,
    partial: Map<String, Value>,
) -> Result<Team, ServiceError> {
    let team = state
        .matches()
        .write()
        .await
        .set_team(group_id, index, partial)?;
    info!(group = %group_id, index, "team updated");

    // set_team succeeded, so the index is a valid slot.
    let slot = usize::try_from(index).unwrap_or_default();
    fan_out(
        state,
        group_id,
        &ServerMessage::MatchTeamSet(TeamSet {
            group_id: group_id.to_string(),
            index: slot,
            team: team.clone(),
        }),
    );
    Ok(team)
}

/// Groups known to the hub, either through a match record or a routed connection.
pub async fn list_groups(state: &SharedState) -> Vec<GroupSummary> {
    let connections = state.connections().read().await;
    let matches = state.matches().read().await;

    let mut groups: indexmap::IndexMap<String, GroupSummary> = matches
        .group_ids()
        .map(|group_id| {
            (
                group_id.to_string(),
                GroupSummary {
                    group_id: group_id.to_string(),
                    overlays: 0,
                    plugins: 0,
                    has_match: true,
                },
            )
        })
        .collect();

    for connection in connections.iter() {
        let Some(group_id) = connection.group() else {
            continue;
        };
        let summary = groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupSummary {
                group_id: group_id.to_string(),
                overlays: 0,
                plugins: 0,
                has_match: false,
            });
        match connection.role() {
            Role::Overlay => summary.overlays += 1,
            Role::Plugin => summary.plugins += 1,
            Role::ControlBoard => {}
        }
    }

    groups.into_values().collect()
}

pub async fn list_connections(state: &SharedState) -> Vec<ConnectionSummary> {
    state
        .connections()
        .read()
        .await
        .iter()
        .map(ConnectionSummary::from)
        .collect()
}

/// Record a scene an overlay can render.
pub async fn register_scene(
    state: &SharedState,
    connection_id: &str,
    registration: SceneRegistration,
) -> Result<(), ServiceError> {
    registration.validate()?;

    let (grouped, overlays) = {
        let mut connections = state.connections().write().await;
        let connection = connections
            .find_mut(connection_id)
            .ok_or_else(|| ServiceError::Forbidden("login required for `scene:register`".into()))?;
        let grouped = connection.group().is_some();
        let overlay = connection.overlay_mut().ok_or_else(|| {
            ServiceError::Forbidden("only overlays may register scenes".into())
        })?;
        overlay.register_scene(
            registration.name.clone(),
            registration.data_format,
            registration.buttons,
        );
        (grouped, summaries(&connections, Role::Overlay))
    };
    debug!(id = %connection_id, scene = %registration.name, "scene registered");

    state.transport().broadcast(
        Role::ControlBoard.room(),
        &[],
        &ServerMessage::OverlayActivated(overlays),
    );
    if grouped {
        replay_scene_cache(state, connection_id, Some(&registration.name)).await;
    }
    Ok(())
}

/// Scene commands control boards relay to a group's overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneRelay {
    Visibility,
    UpdateData,
    Execute,
}

impl SceneRelay {
    fn message(self, command: SceneCommand) -> ServerMessage {
        match self {
            SceneRelay::Visibility => ServerMessage::SceneVisibility(command),
            SceneRelay::UpdateData => ServerMessage::SceneUpdateData(command),
            SceneRelay::Execute => ServerMessage::SceneExecute(command),
        }
    }
}

/// Relay a scene command to the overlays of its group; data pushes are cached per overlay.
pub async fn relay_scene(
    state: &SharedState,
    relay: SceneRelay,
    mut command: SceneCommand,
) -> Result<(), ServiceError> {
    let group = normalize_group_name(&command.group_id)
        .ok_or(ServiceError::InvalidGroupName)?
        .to_string();
    command.group_id = group.clone();

    if relay == SceneRelay::UpdateData {
        let payload = Value::Object(command.payload.clone());
        let mut connections = state.connections().write().await;
        let overlays: Vec<String> = connections
            .find_by_group(&group)
            .into_iter()
            .filter(|connection| connection.role() == Role::Overlay)
            .map(|connection| connection.id.clone())
            .collect();
        for id in overlays {
            if let Some(scene) = connections
                .find_mut(&id)
                .and_then(Connection::overlay_mut)
                .and_then(|overlay| overlay.scene_mut(&command.scene))
            {
                scene.last_data = Some(payload.clone());
            }
        }
    }

    debug!(group = %group, scene = %command.scene, ?relay, "relaying scene command");
    fan_out(state, &group, &relay.message(command));
    Ok(())
}

/// Replay cached scene data from peer overlays of the same group to a newly routed overlay.
async fn replay_scene_cache(state: &SharedState, connection_id: &str, only: Option<&str>) {
    let replays: Vec<SceneCommand> = {
        let mut connections = state.connections().write().await;
        let Some(connection) = connections.find(connection_id) else {
            return;
        };
        let Some(group) = connection.group().map(str::to_string) else {
            return;
        };
        let wanted: Vec<String> = connection
            .overlay()
            .map(|overlay| {
                overlay
                    .scenes
                    .iter()
                    .filter(|scene| only.is_none_or(|name| scene.name == name))
                    .map(|scene| scene.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut replays = Vec::new();
        for scene in wanted {
            let cached = connections
                .find_by_group(&group)
                .into_iter()
                .filter(|peer| peer.id != connection_id)
                .filter_map(Connection::overlay)
                .flat_map(|overlay| overlay.scenes.iter())
                .find(|candidate| candidate.name == scene && candidate.last_data.is_some())
                .and_then(|candidate| candidate.last_data.clone());
            let Some(Value::Object(payload)) = cached else {
                continue;
            };

            if let Some(own) = connections
                .find_mut(connection_id)
                .and_then(Connection::overlay_mut)
                .and_then(|overlay| overlay.scene_mut(&scene))
            {
                own.last_data = Some(Value::Object(payload.clone()));
            }
            replays.push(SceneCommand {
                group_id: group.clone(),
                scene,
                payload,
            });
        }
        replays
    };

    for command in replays {
        debug!(id = %connection_id, scene = %command.scene, "replaying cached scene data");
        state
            .transport()
            .send(connection_id, &ServerMessage::SceneUpdateData(command));
    }
}

fn plugin_context(
    connections: &ConnectionRegistry,
    connection_id: &str,
    active: bool,
    guid: Option<&str>,
) -> PluginContext {
    let mut context = PluginContext {
        active,
        ..PluginContext::default()
    };
    if let Some(guid) = guid.filter(|guid| !guid.is_empty()) {
        for other in connections
            .find_by_ingame_guid(guid)
            .into_iter()
            .filter(|other| other.id != connection_id)
        {
            context.claimed_by_other = true;
            context.claimed_by_other_active |= other.plugin().is_some_and(|plugin| plugin.active);
        }
    }
    context
}

fn schedule_rate_decay(state: &SharedState, connection_id: &str) {
    let state = state.clone();
    let connection_id = connection_id.to_string();
    let window = state.config().rate_window;
    tokio::spawn(async move {
        sleep(window).await;
        let mut connections = state.connections().write().await;
        if let Some(plugin) = connections
            .find_mut(&connection_id)
            .and_then(Connection::plugin_mut)
        {
            plugin.rate = plugin.rate.saturating_sub(1);
        }
    });
}

/// Ingest one telemetry string from a plugin.
pub async fn handle_telemetry(
    state: &SharedState,
    connection_id: &str,
    raw: &str,
) -> Result<(), ServiceError> {
    require_role(state, connection_id, &[Role::Plugin], "game:event").await?;

    let event = match TelemetryEvent::decode(raw) {
        Ok(event) => event,
        Err(err) => {
            let rejected = state.record_rejected_telemetry();
            warn!(id = %connection_id, error = %err, rejected, "dropping malformed telemetry");
            return Ok(());
        }
    };
    let is_update = event.is_update_state();

    let mut connections = state.connections().write().await;
    let connection = connections
        .find(connection_id)
        .ok_or_else(|| ServiceError::ConnectionNotFound(connection_id.to_string()))?;
    let Some(group) = connection.group().map(str::to_string) else {
        debug!(id = %connection_id, event = %event.event, "telemetry from unassigned plugin ignored");
        return Ok(());
    };
    let was_active = connection.plugin().is_some_and(|plugin| plugin.active);
    let context = plugin_context(&connections, connection_id, was_active, event.match_guid());

    let (broadcasts, effects) = {
        let mut matches = state.matches().write().await;
        let current = matches.get_or_create(&group).clone();
        let ParseOutcome {
            record,
            changed,
            broadcasts,
            plugin,
        } = state.parser().parse(current, &context, &event);
        if changed {
            matches.put(record);
        }
        (broadcasts, plugin)
    };

    let mut announce = false;
    if let Some(plugin) = connections
        .find_mut(connection_id)
        .and_then(Connection::plugin_mut)
    {
        plugin.input_count += 1;
        if is_update {
            plugin.rate += 1;
        }
        if let Some(guid) = effects.ingame_match_guid {
            announce |= plugin.ingame_match_guid != guid;
            plugin.ingame_match_guid = guid;
        }
        announce |= plugin.active != effects.active;
        plugin.active = effects.active;
    }
    let plugins = announce.then(|| summaries(&connections, Role::Plugin));
    drop(connections);

    if announce {
        info!(id = %connection_id, group = %group, active = effects.active, "plugin reporter status changed");
    }
    if is_update {
        schedule_rate_decay(state, connection_id);
    }

    let transport = state.transport();
    if !is_update && effects.active {
        transport.broadcast(
            &group,
            &[Role::Plugin.room()],
            &ServerMessage::GameEvent(event.raw),
        );
    }
    for message in &broadcasts {
        match message {
            ServerMessage::MatchUpdateState(_) => {
                transport.broadcast(&group, &[Role::Plugin.room()], message);
            }
            _ => fan_out(state, &group, message),
        }
    }
    if let Some(plugins) = plugins {
        transport.broadcast(
            Role::ControlBoard.room(),
            &[],
            &ServerMessage::PluginActivated(plugins),
        );
    }
    Ok(())
}

/// Clean up after a socket goes away; runs its effects at most once per connection.
pub async fn on_disconnect(state: &SharedState, connection_id: &str) {
    state.login_tickets().remove(connection_id);
    state.transport().detach(connection_id);

    let (removed, promoted, plugins) = {
        let mut connections = state.connections().write().await;
        let Some(removed) = connections.remove(connection_id) else {
            debug!(id = %connection_id, "pending socket closed");
            return;
        };
        let promoted = promote_failover(&mut connections, &removed);
        let plugins = promoted
            .is_some()
            .then(|| summaries(&connections, Role::Plugin));
        (removed, promoted, plugins)
    };

    let role = removed.role();
    info!(id = %connection_id, %role, group = %removed.group_id, "connection removed");

    let transport = state.transport();
    transport.broadcast(
        Role::ControlBoard.room(),
        &[],
        &ServerMessage::deactivated(role, removed.id),
    );
    if let (Some(successor), Some(plugins)) = (promoted, plugins) {
        info!(id = %successor, group = %removed.group_id, "promoted plugin after failover");
        transport.broadcast(
            Role::ControlBoard.room(),
            &[],
            &ServerMessage::PluginActivated(plugins),
        );
    }
}

/// Hand the active flag to a plugin watching the same in-game match in the same group.
fn promote_failover(connections: &mut ConnectionRegistry, removed: &Connection) -> Option<String> {
    let plugin = removed
        .plugin()
        .filter(|plugin| plugin.active && !plugin.ingame_match_guid.is_empty())?;
    let successor = connections
        .find_by_ingame_guid(&plugin.ingame_match_guid)
        .into_iter()
        .find(|candidate| candidate.group_id == removed.group_id)
        .map(|candidate| candidate.id.clone())?;
    if let Some(state) = connections
        .find_mut(&successor)
        .and_then(Connection::plugin_mut)
    {
        state.active = true;
    }
    Some(successor)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use futures::future::BoxFuture;
    use serde_json::json;

    use super::*;
    use crate::{
        config::AppConfig,
        dto::ws::InboundFrame,
        services::auth::{AuthError, Authenticator},
        state::{
            AppState,
            rooms::{Attachment, Outbound},
        },
    };

    struct StaticAuthenticator;

    impl Authenticator for StaticAuthenticator {
        fn authenticate(
            &self,
            credential: Credential,
        ) -> BoxFuture<'static, Result<Identity, AuthError>> {
            let result = match credential {
                Credential::Token(token) if token == "good" => Ok(Identity {
                    email: "caster@example.com".into(),
                    display_name: "Caster".into(),
                }),
                Credential::Token(token) if token == "expired" => Err(AuthError::Expired),
                Credential::Token(_) => Err(AuthError::InvalidToken),
                Credential::Password { email, password } if password == "secret" => Ok(Identity {
                    email,
                    display_name: "Operator".into(),
                }),
                Credential::Password { .. } => Err(AuthError::InvalidCredentials),
            };
            Box::pin(async move { result })
        }
    }

    fn hub_with(config: AppConfig) -> SharedState {
        AppState::new(config, Arc::new(StaticAuthenticator))
    }

    fn hub() -> SharedState {
        hub_with(AppConfig::default())
    }

    struct Client {
        attachment: Attachment,
    }

    impl Client {
        fn connect(state: &SharedState, id: &str) -> Self {
            Self {
                attachment: state.transport().attach(id),
            }
        }

        fn frames(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.attachment.outbound.try_recv() {
                if let Outbound::Text(text) = frame {
                    frames.push(serde_json::from_str(&text).unwrap());
                }
            }
            frames
        }

        fn events(&mut self) -> Vec<String> {
            self.frames()
                .into_iter()
                .map(|frame| frame["event"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    async fn send(state: &SharedState, id: &str, frame: Value) -> Reply {
        let frame = InboundFrame::from_json_str(&frame.to_string()).unwrap();
        dispatch(state, id, frame.message).await
    }

    async fn login(state: &SharedState, id: &str, role: &str) -> Client {
        let mut client = Client::connect(state, id);
        send(
            state,
            id,
            json!({"event": "login", "data": {"token": "good", "role": role, "name": id}}),
        )
        .await
        .unwrap();
        client.frames();
        client
    }

    async fn assign(state: &SharedState, id: &str, group: &str) {
        send(
            state,
            id,
            json!({"event": "relay:assign", "data": {"id": id, "group_id": group}}),
        )
        .await
        .unwrap();
    }

    fn telemetry(event: &str, data: Value) -> Value {
        let raw = json!({"game": "ROCKET_LEAGUE", "event": event, "data": data}).to_string();
        json!({"event": "game:event", "data": raw})
    }

    fn update_state(guid: &str) -> Value {
        telemetry(
            "game:update_state",
            json!({
                "match_guid": guid,
                "game": {"arena": "Mannfield", "teams": {"0": {"score": 2}, "1": {"score": 1}}},
                "players": [{"team": 0}, {"team": 0}, {"team": 1}]
            }),
        )
    }

    async fn plugin_state(state: &SharedState, id: &str) -> crate::state::registry::PluginState {
        state
            .connections()
            .read()
            .await
            .find(id)
            .and_then(Connection::plugin)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn token_login_registers_and_announces() {
        let state = hub();
        let mut control = login(&state, "control-1", "CONTROLBOARD").await;
        let mut overlay = Client::connect(&state, "overlay-1");

        let reply = send(
            &state,
            "overlay-1",
            json!({"event": "login", "data": {"token": "good", "role": "OVERLAY", "name": "Main"}}),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply["role"], "OVERLAY");
        assert_eq!(reply["server"]["name"], env!("CARGO_PKG_NAME"));

        let pushed = overlay.frames();
        assert_eq!(pushed[0]["event"], "logged_in");
        assert_eq!(pushed[0]["data"]["identity"]["email"], "caster@example.com");

        let announced = control.frames();
        assert_eq!(announced[0]["event"], "overlay:activated");
        assert_eq!(announced[0]["data"][0]["name"], "Main");

        let err = send(
            &state,
            "overlay-1",
            json!({"event": "login", "data": {"token": "good", "role": "PLUGIN"}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyAuthenticated));
        assert_eq!(state.connections().read().await.len(), 2);
    }

    #[tokio::test]
    async fn rejected_token_leaves_connection_pending() {
        let state = hub();
        let _client = Client::connect(&state, "p");
        for token in ["expired", "INVALID_TOKEN"] {
            let err = send(
                &state,
                "p",
                json!({"event": "login", "data": {"token": token, "role": "PLUGIN"}}),
            )
            .await
            .unwrap_err();
            assert_eq!(err.kind(), "AuthError");
        }
        assert!(state.connections().read().await.is_empty());

        let err = send(
            &state,
            "p",
            json!({"event": "login", "data": {"token": "", "role": "PLUGIN"}}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn empty_group_is_rejected_before_lookup() {
        let state = hub();
        let _control = login(&state, "c", "CONTROLBOARD").await;

        for id in ["c", "missing", ""] {
            let err = send(
                &state,
                "c",
                json!({"event": "relay:assign", "data": {"id": id, "group_id": "  "}}),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidGroupName));
        }

        let err = send(
            &state,
            "c",
            json!({"event": "relay:assign", "data": {"id": "missing", "group_id": "finals"}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::ConnectionNotFound(_)));
    }

    #[tokio::test]
    async fn plugin_assignment_creates_match_but_overlay_does_not() {
        let state = hub();
        let _overlay = login(&state, "o", "OVERLAY").await;
        assign(&state, "o", "semis").await;
        assert!(state.matches().read().await.is_empty());

        let mut plugin = login(&state, "p", "PLUGIN").await;
        assign(&state, "p", "finals").await;
        assert!(state.matches().read().await.contains("finals"));
        assert_eq!(plugin.events(), ["relay:assigned"]);

        let record = send(&state, "o", json!({"event": "match:get", "data": {"group_id": "finals"}}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["bestOf"], 5);

        let err = send(&state, "o", json!({"event": "match:get", "data": {"group_id": "semis"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn only_control_boards_assign_others() {
        let state = hub();
        let _overlay = login(&state, "o", "OVERLAY").await;
        let _plugin = login(&state, "p", "PLUGIN").await;
        let _control = login(&state, "c", "CONTROLBOARD").await;

        let err = send(
            &state,
            "o",
            json!({"event": "relay:assign", "data": {"id": "p", "group_id": "g"}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        send(
            &state,
            "c",
            json!({"event": "relay:assign", "data": {"id": "p", "group_id": "g"}}),
        )
        .await
        .unwrap();
        let connections = state.connections().read().await;
        assert_eq!(connections.find("p").unwrap().group_id, "g");
    }

    #[tokio::test]
    async fn moving_groups_leaves_the_old_room() {
        let state = hub();
        let mut overlay = login(&state, "o", "OVERLAY").await;
        assign(&state, "o", "g1").await;
        assign(&state, "o", "g2").await;
        overlay.frames();

        let mut plugin = login(&state, "p", "PLUGIN").await;
        assign(&state, "p", "g1").await;
        plugin.frames();
        send(&state, "p", update_state("M1")).await.unwrap();
        assert!(overlay.frames().is_empty());

        assign(&state, "o", "Unassigned").await;
        let connections = state.connections().read().await;
        assert_eq!(connections.find("o").unwrap().group(), None);
    }

    #[tokio::test]
    async fn telemetry_reaches_group_but_never_plugins() {
        let state = hub();
        let mut overlay = login(&state, "o", "OVERLAY").await;
        let mut reporter = login(&state, "p1", "PLUGIN").await;
        let mut observer = login(&state, "p2", "PLUGIN").await;
        for id in ["o", "p1", "p2"] {
            assign(&state, id, "finals").await;
        }
        overlay.frames();
        reporter.frames();
        observer.frames();

        send(&state, "p1", update_state("M1")).await.unwrap();
        let frames = overlay.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "match:update_state");
        assert_eq!(frames[0]["data"]["teams"][0]["players"].as_array().unwrap().len(), 2);
        assert_eq!(frames[0]["data"]["teams"][0]["score"], 2);
        assert_eq!(frames[0]["data"]["teams"][1]["players"].as_array().unwrap().len(), 1);

        send(&state, "p1", telemetry("game:goal_scored", json!({"scorer": "a"})))
            .await
            .unwrap();
        let frames = overlay.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "game:event");
        assert_eq!(frames[0]["data"]["event"], "game:goal_scored");
        assert_eq!(frames[0]["data"]["data"]["scorer"], "a");

        assert!(reporter.events().iter().all(|event| event != "match:update_state" && event != "game:event"));
        assert!(observer.events().iter().all(|event| event != "match:update_state" && event != "game:event"));

        let stats = plugin_state(&state, "p1").await;
        assert_eq!(stats.input_count, 2);
        assert!(stats.active);
        assert_eq!(stats.ingame_match_guid, "M1");
    }

    #[tokio::test]
    async fn unassigned_plugin_telemetry_is_inert() {
        let state = hub();
        let _plugin = login(&state, "p", "PLUGIN").await;
        send(&state, "p", update_state("M1")).await.unwrap();

        assert!(state.matches().read().await.is_empty());
        let stats = plugin_state(&state, "p").await;
        assert_eq!(stats.input_count, 0);
        assert_eq!(stats.ingame_match_guid, "");
    }

    #[tokio::test]
    async fn malformed_telemetry_is_counted_not_fatal() {
        let state = hub();
        let _plugin = login(&state, "p", "PLUGIN").await;
        assign(&state, "p", "g").await;

        send(&state, "p", json!({"event": "game:event", "data": "{oops"}))
            .await
            .unwrap();
        send(&state, "p", json!({"event": "game:event", "data": "{}"}))
            .await
            .unwrap();
        assert_eq!(state.telemetry_rejected(), 2);

        send(&state, "p", update_state("M1")).await.unwrap();
        assert!(plugin_state(&state, "p").await.active);
    }

    #[tokio::test]
    async fn non_plugins_cannot_send_telemetry() {
        let state = hub();
        let _overlay = login(&state, "o", "OVERLAY").await;
        let err = send(&state, "o", update_state("M1")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn duplicate_reporter_stays_inactive() {
        let state = hub();
        let _first = login(&state, "p1", "PLUGIN").await;
        let _second = login(&state, "p2", "PLUGIN").await;
        assign(&state, "p1", "finals").await;
        assign(&state, "p2", "finals").await;

        send(&state, "p1", update_state("SHARED")).await.unwrap();
        let before = get_match(&state, "finals").await.unwrap();

        let changed = telemetry(
            "game:update_state",
            json!({"match_guid": "SHARED", "game": {"arena": "Other", "teams": {"0": {"score": 9}}}}),
        );
        send(&state, "p2", changed).await.unwrap();

        let after = get_match(&state, "finals").await.unwrap();
        assert_eq!(before, after);
        assert!(plugin_state(&state, "p1").await.active);
        let second = plugin_state(&state, "p2").await;
        assert!(!second.active);
        assert_eq!(second.ingame_match_guid, "SHARED");

        let ended = telemetry("game:match_ended", json!({"winner_team_num": 0}));
        send(&state, "p2", ended).await.unwrap();
        let after = get_match(&state, "finals").await.unwrap();
        assert_eq!(after.teams[0].series, 0);
    }

    #[tokio::test]
    async fn inactive_duplicate_events_are_not_relayed() {
        let state = hub();
        let mut overlay = login(&state, "o", "OVERLAY").await;
        let _first = login(&state, "p1", "PLUGIN").await;
        let _second = login(&state, "p2", "PLUGIN").await;
        assign(&state, "o", "finals").await;
        assign(&state, "p1", "finals").await;
        assign(&state, "p2", "finals").await;
        send(&state, "p1", update_state("SHARED")).await.unwrap();
        send(&state, "p2", update_state("SHARED")).await.unwrap();
        assert!(!plugin_state(&state, "p2").await.active);
        overlay.frames();

        send(&state, "p2", telemetry("game:goal_scored", json!({"scorer": "b"})))
            .await
            .unwrap();
        send(&state, "p2", telemetry("game:match_ended", json!({"winner_team_num": 0})))
            .await
            .unwrap();
        assert!(overlay.events().is_empty());

        send(&state, "p1", telemetry("game:goal_scored", json!({"scorer": "a"})))
            .await
            .unwrap();
        assert_eq!(overlay.events(), ["game:event"]);
    }

    #[tokio::test]
    async fn login_fails_once_the_socket_is_detached() {
        let state = hub();
        let _client = Client::connect(&state, "pending");
        request_login_path(&state, "pending", Role::Overlay)
            .await
            .unwrap();
        state.transport().detach("pending");

        let identity = state
            .authenticator()
            .authenticate(Credential::Token("good".into()))
            .await
            .unwrap();
        let err = complete_login(&state, "pending", Role::Overlay, identity, String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ConnectionNotFound(_)));
        assert!(state.connections().read().await.is_empty());
    }

    #[tokio::test]
    async fn match_get_defaults_to_own_group() {
        let state = hub();
        let _plugin = login(&state, "p", "PLUGIN").await;
        let _overlay = login(&state, "o", "OVERLAY").await;

        let err = send(&state, "p", json!({"event": "match:get", "data": {}}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        assign(&state, "p", "finals").await;
        let record = send(&state, "p", json!({"event": "match:get", "data": {}}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["group_id"], "finals");

        let record = send(
            &state,
            "o",
            json!({"event": "match:get", "data": {"group_id": "finals"}}),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(record["group_id"], "finals");
    }

    #[tokio::test]
    async fn series_win_is_announced_to_group_and_control() {
        let state = hub();
        let mut control = login(&state, "c", "CONTROLBOARD").await;
        let mut overlay = login(&state, "o", "OVERLAY").await;
        let _plugin = login(&state, "p", "PLUGIN").await;
        assign(&state, "o", "finals").await;
        assign(&state, "p", "finals").await;
        send(&state, "p", update_state("M1")).await.unwrap();
        overlay.frames();
        control.frames();

        for _ in 0..3 {
            send(
                &state,
                "p",
                telemetry("game:match_ended", json!({"winner_team_num": 1})),
            )
            .await
            .unwrap();
        }

        let record = get_match(&state, "finals").await.unwrap();
        assert!(record.has_winner);
        assert_eq!(record.winner, 1);
        assert_eq!(record.teams[1].series, 3);

        let overlay_events = overlay.events();
        assert_eq!(overlay_events.iter().filter(|e| *e == "game:ended").count(), 3);
        assert_eq!(overlay_events.iter().filter(|e| *e == "match:ended").count(), 1);
        assert!(control.events().contains(&"match:ended".to_string()));
    }

    #[tokio::test]
    async fn failover_promotes_same_group_peer() {
        let state = hub();
        let mut control = login(&state, "c", "CONTROLBOARD").await;
        for id in ["p1", "p2", "p3"] {
            let _ = login(&state, id, "PLUGIN").await;
        }
        assign(&state, "p1", "finals").await;
        assign(&state, "p2", "finals").await;
        assign(&state, "p3", "other").await;
        for id in ["p1", "p2", "p3"] {
            send(&state, id, update_state("M1")).await.unwrap();
        }
        assert!(plugin_state(&state, "p1").await.active);
        assert!(!plugin_state(&state, "p2").await.active);
        control.frames();

        on_disconnect(&state, "p1").await;
        assert!(plugin_state(&state, "p2").await.active);
        assert!(!plugin_state(&state, "p3").await.active);
        let events = control.events();
        assert_eq!(events, ["plugin:deactivated", "plugin:activated"]);

        on_disconnect(&state, "p1").await;
        assert!(control.events().is_empty());
    }

    #[tokio::test]
    async fn failover_without_peer_leaves_group_inactive() {
        let state = hub();
        let _first = login(&state, "p1", "PLUGIN").await;
        let _second = login(&state, "p2", "PLUGIN").await;
        assign(&state, "p1", "finals").await;
        assign(&state, "p2", "other").await;
        send(&state, "p1", update_state("M1")).await.unwrap();
        send(&state, "p2", update_state("M1")).await.unwrap();

        on_disconnect(&state, "p1").await;
        let connections = state.connections().read().await;
        assert!(
            connections
                .find_by_group("finals")
                .iter()
                .all(|connection| !connection.plugin().is_some_and(|plugin| plugin.active))
        );
    }

    #[tokio::test]
    async fn team_and_match_mutations_never_create_matches() {
        let state = hub();
        let _control = login(&state, "c", "CONTROLBOARD").await;

        let err = send(
            &state,
            "c",
            json!({"event": "match:update", "data": {"group_id": "ghost", "match": {"bestOf": 3}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let err = send(
            &state,
            "c",
            json!({"event": "match:set_team", "data": {"group_id": "ghost", "index": 0, "team": {}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(state.matches().read().await.is_empty());
    }

    #[tokio::test]
    async fn set_team_bounds_and_broadcast() {
        let state = hub();
        let mut control = login(&state, "c", "CONTROLBOARD").await;
        let mut overlay = login(&state, "o", "OVERLAY").await;
        let _plugin = login(&state, "p", "PLUGIN").await;
        assign(&state, "o", "finals").await;
        assign(&state, "p", "finals").await;
        send(&state, "p", update_state("M1")).await.unwrap();
        let before = get_match(&state, "finals").await.unwrap();
        control.frames();
        overlay.frames();

        for index in [2, -1] {
            let err = send(
                &state,
                "c",
                json!({"event": "match:set_team", "data": {"group_id": "finals", "index": index, "team": {"name": "X"}}}),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ServiceError::IndexOutOfBounds { .. }));
        }
        assert_eq!(get_match(&state, "finals").await.unwrap(), before);

        let team = send(
            &state,
            "c",
            json!({"event": "match:set_team", "data": {"group_id": "finals", "index": 1, "team": {"name": "Cats", "series": 3}}}),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(team["name"], "Cats");

        let record = get_match(&state, "finals").await.unwrap();
        assert!(record.has_winner);
        assert_eq!(record.winner, 1);
        assert_eq!(control.events(), ["match:team_set"]);
        assert_eq!(overlay.events(), ["match:team_set"]);
    }

    #[tokio::test]
    async fn control_commands_are_gated_by_role() {
        let state = hub();
        let _overlay = login(&state, "o", "OVERLAY").await;
        let _pending = Client::connect(&state, "pending");

        for (id, frame) in [
            ("o", json!({"event": "group:list"})),
            ("o", json!({"event": "connection:list"})),
            ("o", json!({"event": "relay:deactivate", "data": {"id": "o"}})),
            ("pending", json!({"event": "match:update", "data": {"group_id": "g", "match": {}}})),
        ] {
            let err = send(&state, id, frame).await.unwrap_err();
            assert!(matches!(err, ServiceError::Forbidden(_)), "{id}: {err}");
        }

        let all = send(&state, "pending", json!({"event": "match:get_all"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(all, json!([]));
    }

    #[tokio::test]
    async fn group_and_connection_listings() {
        let state = hub();
        let _control = login(&state, "c", "CONTROLBOARD").await;
        let _overlay = login(&state, "o", "OVERLAY").await;
        let _plugin = login(&state, "p", "PLUGIN").await;
        assign(&state, "p", "finals").await;
        assign(&state, "o", "finals").await;

        let groups = list_groups(&state).await;
        assert_eq!(
            groups,
            [GroupSummary {
                group_id: "finals".into(),
                overlays: 1,
                plugins: 1,
                has_match: true,
            }]
        );

        let listed = send(&state, "c", json!({"event": "connection:list"}))
            .await
            .unwrap()
            .unwrap();
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[2]["role"], "PLUGIN");
        assert_eq!(listed[2]["active"], false);
        assert!(listed[0].get("active").is_none());
    }

    #[tokio::test]
    async fn deactivate_disconnects_but_spares_control_boards() {
        let state = hub();
        let mut control = login(&state, "c1", "CONTROLBOARD").await;
        let _other = login(&state, "c2", "CONTROLBOARD").await;
        let overlay = login(&state, "o", "OVERLAY").await;
        control.frames();

        let err = send(&state, "c1", json!({"event": "relay:deactivate", "data": {"id": "c2"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let err = send(&state, "c1", json!({"event": "relay:deactivate", "data": {"id": "nobody"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ConnectionNotFound(_)));

        send(&state, "c1", json!({"event": "relay:deactivate", "data": {"id": "o"}}))
            .await
            .unwrap();
        assert!(*overlay.attachment.closed.borrow());
        assert!(!state.connections().read().await.contains("o"));
        assert!(!state.transport().is_attached("o"));

        let frames = control.frames();
        assert_eq!(frames[0]["event"], "overlay:deactivated");
        assert_eq!(frames[0]["data"]["id"], "o");
    }

    #[tokio::test]
    async fn scene_commands_reach_overlays_and_cache_for_late_joiners() {
        let state = hub();
        let _control = login(&state, "c", "CONTROLBOARD").await;
        let mut first = login(&state, "o1", "OVERLAY").await;
        let mut plugin = login(&state, "p", "PLUGIN").await;
        assign(&state, "o1", "finals").await;
        assign(&state, "p", "finals").await;
        send(
            &state,
            "o1",
            json!({"event": "scene:register", "data": {"name": "scoreboard", "dataFormat": {"title": "string"}}}),
        )
        .await
        .unwrap();
        first.frames();
        plugin.frames();

        send(
            &state,
            "c",
            json!({"event": "scene:update_data", "data": {"group_id": "finals", "scene": "scoreboard", "title": "Grand Final"}}),
        )
        .await
        .unwrap();
        let frames = first.frames();
        assert_eq!(frames[0]["event"], "scene:update_data");
        assert_eq!(frames[0]["data"]["title"], "Grand Final");
        assert!(plugin.frames().is_empty());

        let mut late = login(&state, "o2", "OVERLAY").await;
        assign(&state, "o2", "finals").await;
        send(
            &state,
            "o2",
            json!({"event": "scene:register", "data": {"name": "scoreboard"}}),
        )
        .await
        .unwrap();
        let replayed: Vec<Value> = late
            .frames()
            .into_iter()
            .filter(|frame| frame["event"] == "scene:update_data")
            .collect();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0]["data"]["title"], "Grand Final");

        let err = send(
            &state,
            "p",
            json!({"event": "scene:register", "data": {"name": "scoreboard"}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn login_path_ticket_is_redeemed_once() {
        let state = hub();
        let mut client = Client::connect(&state, "pending");

        let path = send(&state, "pending", json!({"event": "login:path", "data": {"role": "OVERLAY"}}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path, json!("/login/pending"));
        assert_eq!(login_ticket(&state, "pending").await.unwrap(), Role::Overlay);

        let form = |password: &str| LoginForm {
            email: "op@example.com".into(),
            password: password.into(),
            name: String::new(),
        };
        let err = redeem_login_ticket(&state, "pending", form("wrong"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "AuthError");

        let logged_in = redeem_login_ticket(&state, "pending", form("secret"))
            .await
            .unwrap();
        assert_eq!(logged_in.role, Role::Overlay);
        assert_eq!(client.events(), ["logged_in"]);
        let connections = state.connections().read().await;
        assert_eq!(connections.find("pending").unwrap().name, "Operator");
        drop(connections);

        let err = redeem_login_ticket(&state, "pending", form("secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyAuthenticated));
    }

    #[tokio::test]
    async fn default_group_is_joined_after_login() {
        let config = AppConfig {
            default_group: Some("lobby".into()),
            ..AppConfig::default()
        };
        let state = hub_with(config);
        let _plugin = login(&state, "p", "PLUGIN").await;
        let _control = login(&state, "c", "CONTROLBOARD").await;

        let connections = state.connections().read().await;
        assert_eq!(connections.find("p").unwrap().group_id, "lobby");
        assert_eq!(connections.find("c").unwrap().group_id, "");
        drop(connections);
        assert!(state.matches().read().await.contains("lobby"));
    }

    #[tokio::test]
    async fn rate_decays_after_window() {
        let config = AppConfig {
            rate_window: Duration::from_millis(20),
            ..AppConfig::default()
        };
        let state = hub_with(config);
        let _plugin = login(&state, "p", "PLUGIN").await;
        assign(&state, "p", "g").await;

        send(&state, "p", update_state("M1")).await.unwrap();
        send(&state, "p", update_state("M1")).await.unwrap();
        assert_eq!(plugin_state(&state, "p").await.rate, 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = plugin_state(&state, "p").await;
        assert_eq!(stats.rate, 0);
        assert_eq!(stats.input_count, 2);
    }
}
