//! Registry of authenticated connections and their role-specific bookkeeping.

use std::{fmt, time::SystemTime};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use crate::services::auth::Identity;

/// Group value meaning "not routed to any match".
pub const UNASSIGNED_GROUP: &str = "Unassigned";

/// Client classes the hub distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Overlay,
    Plugin,
    #[serde(rename = "CONTROLBOARD")]
    ControlBoard,
}

impl Role {
    /// Transport room every connection of this role joins after login.
    pub fn room(self) -> &'static str {
        match self {
            Role::Overlay => "overlay",
            Role::Plugin => "plugin",
            Role::ControlBoard => "control",
        }
    }

    /// Whether connections of this role are routed to a single group.
    pub fn is_grouped(self) -> bool {
        !matches!(self, Role::ControlBoard)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Overlay => "OVERLAY",
            Role::Plugin => "PLUGIN",
            Role::ControlBoard => "CONTROLBOARD",
        })
    }
}

/// Visual scene an overlay can render, with the last payload pushed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub name: String,
    pub data_format: Value,
    pub buttons: Vec<Value>,
    pub last_data: Option<Value>,
}

/// Overlay-only connection state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayState {
    pub scenes: Vec<Scene>,
}

impl OverlayState {
    /// Insert or replace the scene with the same name, keeping its cached payload.
    pub fn register_scene(&mut self, name: String, data_format: Value, buttons: Vec<Value>) {
        match self.scenes.iter_mut().find(|scene| scene.name == name) {
            Some(scene) => {
                scene.data_format = data_format;
                scene.buttons = buttons;
            }
            None => self.scenes.push(Scene {
                name,
                data_format,
                buttons,
                last_data: None,
            }),
        }
    }

    pub fn scene_mut(&mut self, name: &str) -> Option<&mut Scene> {
        self.scenes.iter_mut().find(|scene| scene.name == name)
    }
}

/// Plugin-only connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginState {
    /// Approximate `update_state` events per second.
    pub rate: u32,
    /// Total telemetry events received.
    pub input_count: u64,
    /// Whether this plugin is the authoritative reporter for its in-game match.
    pub active: bool,
    /// The game engine's own match identifier, used for failover.
    pub ingame_match_guid: String,
}

/// Role-tagged state carried by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionKind {
    Overlay(OverlayState),
    Plugin(PluginState),
    ControlBoard,
}

impl ConnectionKind {
    /// Empty role state for a freshly logged-in connection.
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Overlay => ConnectionKind::Overlay(OverlayState::default()),
            Role::Plugin => ConnectionKind::Plugin(PluginState::default()),
            Role::ControlBoard => ConnectionKind::ControlBoard,
        }
    }
}

/// One authenticated transport session.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: String,
    pub identity: Identity,
    /// Display name chosen at login.
    pub name: String,
    pub group_id: String,
    pub connected_at: SystemTime,
    pub kind: ConnectionKind,
}

impl Connection {
    /// Build an unassigned connection for `role`.
    pub fn new(id: impl Into<String>, role: Role, identity: Identity, name: String) -> Self {
        Self {
            id: id.into(),
            identity,
            name,
            group_id: String::new(),
            connected_at: SystemTime::now(),
            kind: ConnectionKind::for_role(role),
        }
    }

    pub fn role(&self) -> Role {
        match self.kind {
            ConnectionKind::Overlay(_) => Role::Overlay,
            ConnectionKind::Plugin(_) => Role::Plugin,
            ConnectionKind::ControlBoard => Role::ControlBoard,
        }
    }

    /// Assigned group, if the connection is routed to one.
    pub fn group(&self) -> Option<&str> {
        is_assigned(&self.group_id).then_some(self.group_id.as_str())
    }

    pub fn plugin(&self) -> Option<&PluginState> {
        match &self.kind {
            ConnectionKind::Plugin(state) => Some(state),
            _ => None,
        }
    }

    pub fn plugin_mut(&mut self) -> Option<&mut PluginState> {
        match &mut self.kind {
            ConnectionKind::Plugin(state) => Some(state),
            _ => None,
        }
    }

    pub fn overlay(&self) -> Option<&OverlayState> {
        match &self.kind {
            ConnectionKind::Overlay(state) => Some(state),
            _ => None,
        }
    }

    pub fn overlay_mut(&mut self) -> Option<&mut OverlayState> {
        match &mut self.kind {
            ConnectionKind::Overlay(state) => Some(state),
            _ => None,
        }
    }
}

/// Whether a group value routes to a match.
pub fn is_assigned(group_id: &str) -> bool {
    !group_id.is_empty() && group_id != UNASSIGNED_GROUP
}

/// Errors raised by [`ConnectionRegistry`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection `{0}` is already registered")]
    Duplicate(String),
}

/// Live connections keyed by id, kept in login order.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: IndexMap<String, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; ids are unique among live entries.
    pub fn add(&mut self, connection: Connection) -> Result<(), RegistryError> {
        if self.connections.contains_key(&connection.id) {
            return Err(RegistryError::Duplicate(connection.id));
        }
        self.connections.insert(connection.id.clone(), connection);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Connection> {
        self.connections.shift_remove(id)
    }

    pub fn find(&self, id: &str) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn find_by_group(&self, group_id: &str) -> Vec<&Connection> {
        self.connections
            .values()
            .filter(|connection| connection.group_id == group_id)
            .collect()
    }

    /// Plugins currently reporting the given in-game match identifier.
    pub fn find_by_ingame_guid(&self, guid: &str) -> Vec<&Connection> {
        self.connections
            .values()
            .filter(|connection| {
                connection
                    .plugin()
                    .is_some_and(|plugin| plugin.ingame_match_guid == guid)
            })
            .collect()
    }

    pub fn find_by_role(&self, role: Role) -> Vec<&Connection> {
        self.connections
            .values()
            .filter(|connection| connection.role() == role)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
