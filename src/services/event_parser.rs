//! Folds plugin telemetry into match state.
//!
//! Everything here is pure: the hub hands in a copy of the match and what it knows about the
//! reporting plugin, and gets back the new match, the messages to fan out and the plugin
//! bookkeeping to store.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::{
    config::TeamTemplate,
    dto::ws::{GameEnded, ServerMessage},
    state::matches::{GameSnapshot, Match, Team},
};

pub const EVENT_UPDATE_STATE: &str = "game:update_state";
pub const EVENT_MATCH_ENDED: &str = "game:match_ended";
pub const EVENT_MATCH_DESTROYED: &str = "game:match_destroyed";

/// Title assumed when a plugin does not name its game.
pub const ROCKET_LEAGUE: &str = "ROCKET_LEAGUE";

/// Reasons a raw telemetry string is rejected.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("malformed telemetry JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("telemetry event has no event name")]
    MissingEvent,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    game: Option<String>,
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decoded telemetry event, keeping the original document for verbatim relays.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub game: Option<String>,
    pub event: String,
    pub data: Value,
    pub raw: Value,
}

impl TelemetryEvent {
    /// Decode the JSON string a plugin sends as its `game:event` payload.
    pub fn decode(text: &str) -> Result<Self, TelemetryError> {
        let raw: Value = serde_json::from_str(text)?;
        let envelope: Envelope = serde_json::from_value(raw.clone())?;
        if envelope.event.is_empty() {
            return Err(TelemetryError::MissingEvent);
        }
        Ok(Self {
            game: envelope.game,
            event: envelope.event,
            data: envelope.data,
            raw,
        })
    }

    pub fn is_update_state(&self) -> bool {
        self.event == EVENT_UPDATE_STATE
    }

    /// In-game match identifier reported by an `update_state` event.
    pub fn match_guid(&self) -> Option<&str> {
        self.data
            .get("match_guid")
            .or_else(|| self.data.get("game").and_then(|game| game.get("match_guid")))
            .and_then(Value::as_str)
    }
}

/// What the hub knows about the reporting plugin when the event arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginContext {
    /// Whether the plugin is currently the authoritative reporter.
    pub active: bool,
    /// Another registered plugin already reports the event's in-game match.
    pub claimed_by_other: bool,
    /// One of those other plugins is active.
    pub claimed_by_other_active: bool,
}

/// Plugin bookkeeping to persist after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEffects {
    pub active: bool,
    /// New in-game match identifier, when the event carried one.
    pub ingame_match_guid: Option<String>,
}

/// Result of folding one event.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub record: Match,
    pub changed: bool,
    /// Messages for the plugin's group, excluding plugins.
    pub broadcasts: Vec<ServerMessage>,
    pub plugin: PluginEffects,
}

impl ParseOutcome {
    fn unchanged(record: Match, plugin: PluginEffects) -> Self {
        Self {
            record,
            changed: false,
            broadcasts: Vec::new(),
            plugin,
        }
    }
}

/// Game-specific handling of `update_state` payloads.
pub trait TitleParser: Send + Sync {
    /// Value of the telemetry `game` field this parser handles.
    fn title(&self) -> &'static str;

    /// Merge an `update_state` payload into the match.
    fn fold_update_state(&self, record: &mut Match, data: &Value, templates: &[TeamTemplate]);
}

/// Rocket League telemetry: two teams, players tagged with their team number.
pub struct RocketLeague;

impl TitleParser for RocketLeague {
    fn title(&self) -> &'static str {
        ROCKET_LEAGUE
    }

    fn fold_update_state(&self, record: &mut Match, data: &Value, templates: &[TeamTemplate]) {
        ensure_team_slots(record, 2, templates);

        let players = players_of(data.get("players"));
        let mut game = data
            .get("game")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let team_states = game.remove("teams");

        for (index, team) in record.teams.iter_mut().take(2).enumerate() {
            team.players = players
                .iter()
                .filter(|player| player.get("team").and_then(Value::as_u64) == Some(index as u64))
                .cloned()
                .collect();
            if let Some(score) = team_states
                .as_ref()
                .and_then(|teams| team_entry(teams, index))
                .and_then(|state| state.get("score"))
                .and_then(Value::as_i64)
            {
                team.score = score;
            }
        }

        let snapshot = record.game.get_or_insert_with(GameSnapshot::default);
        merge_game_fields(snapshot, game);
    }
}

fn players_of(players: Option<&Value>) -> Vec<Value> {
    match players {
        Some(Value::Array(list)) => list.clone(),
        Some(Value::Object(map)) => map.values().cloned().collect(),
        _ => Vec::new(),
    }
}

fn team_entry(teams: &Value, index: usize) -> Option<&Value> {
    match teams {
        Value::Object(map) => map.get(&index.to_string()),
        Value::Array(list) => list.get(index),
        _ => None,
    }
}

/// Append default teams until the match has `count` slots.
fn ensure_team_slots(record: &mut Match, count: usize, templates: &[TeamTemplate]) {
    while record.teams.len() < count {
        let index = record.teams.len();
        let team = match templates.get(index % templates.len().max(1)) {
            Some(template) => Team {
                name: template.name.clone(),
                avatar: template.avatar.clone(),
                color_primary: template.color_primary.clone(),
                color_secondary: template.color_secondary.clone(),
                ..Team::default()
            },
            None => Team::default(),
        };
        record.teams.push(team);
    }
}

/// Shallow-merge telemetry game fields into the snapshot.
fn merge_game_fields(snapshot: &mut GameSnapshot, fields: Map<String, Value>) {
    for (key, value) in fields {
        match key.as_str() {
            "winner" => {
                if let Some(winner) = value.as_i64().and_then(|winner| i32::try_from(winner).ok()) {
                    snapshot.winner = winner;
                }
            }
            "hasWinner" => {
                if let Some(has_winner) = value.as_bool() {
                    snapshot.has_winner = has_winner;
                }
            }
            "match_guid" => snapshot.match_guid = value.as_str().map(str::to_string),
            _ => {
                snapshot.fields.insert(key, value);
            }
        }
    }
}

/// Telemetry folding with the configured team templates and supported titles.
pub struct EventParser {
    templates: Vec<TeamTemplate>,
    titles: Vec<Box<dyn TitleParser>>,
}

impl EventParser {
    pub fn new(templates: Vec<TeamTemplate>) -> Self {
        Self {
            templates,
            titles: vec![Box::new(RocketLeague)],
        }
    }

    fn title(&self, game: Option<&str>) -> Option<&dyn TitleParser> {
        let wanted = game.unwrap_or(ROCKET_LEAGUE);
        for parser in &self.titles {
            if parser.title() == wanted {
                return Some(parser.as_ref());
            }
        }
        None
    }

    /// Fold `event` into `record` on behalf of a plugin described by `plugin`.
    pub fn parse(
        &self,
        record: Match,
        plugin: &PluginContext,
        event: &TelemetryEvent,
    ) -> ParseOutcome {
        let effects = PluginEffects {
            active: plugin.active,
            ingame_match_guid: None,
        };

        match event.event.as_str() {
            EVENT_UPDATE_STATE => self.update_state(record, plugin, event),
            EVENT_MATCH_ENDED if plugin.active => match_ended(record, event, effects),
            EVENT_MATCH_DESTROYED if plugin.active => {
                let mut record = record;
                record.game = None;
                let snapshot = record.clone();
                ParseOutcome {
                    record,
                    changed: true,
                    broadcasts: vec![ServerMessage::MatchUpdateState(snapshot)],
                    plugin: effects,
                }
            }
            _ => ParseOutcome::unchanged(record, effects),
        }
    }

    fn update_state(
        &self,
        mut record: Match,
        plugin: &PluginContext,
        event: &TelemetryEvent,
    ) -> ParseOutcome {
        let guid = event.match_guid().unwrap_or_default().to_string();
        let active = !plugin.claimed_by_other || (plugin.active && !plugin.claimed_by_other_active);
        let effects = PluginEffects {
            active,
            ingame_match_guid: Some(guid.clone()),
        };
        if !active {
            return ParseOutcome::unchanged(record, effects);
        }

        let Some(title) = self.title(event.game.as_deref()) else {
            warn!(game = ?event.game, "no parser for telemetry title; state not merged");
            return ParseOutcome::unchanged(record, effects);
        };

        title.fold_update_state(&mut record, &event.data, &self.templates);
        if !guid.is_empty() {
            if let Some(game) = record.game.as_mut() {
                game.match_guid = Some(guid);
            }
        }

        let snapshot = record.clone();
        ParseOutcome {
            record,
            changed: true,
            broadcasts: vec![ServerMessage::MatchUpdateState(snapshot)],
            plugin: effects,
        }
    }
}

fn match_ended(mut record: Match, event: &TelemetryEvent, effects: PluginEffects) -> ParseOutcome {
    let winner = event
        .data
        .get("winner_team_num")
        .and_then(Value::as_u64)
        .and_then(|winner| usize::try_from(winner).ok())
        .filter(|winner| *winner < record.teams.len());
    let Some(winner) = winner else {
        warn!(
            data = %event.data,
            teams = record.teams.len(),
            "match_ended without a valid winning team; ignoring"
        );
        return ParseOutcome::unchanged(record, effects);
    };

    record.teams[winner].series += 1;
    let game = record.game.get_or_insert_with(GameSnapshot::default);
    game.winner = winner as i32;
    game.has_winner = true;
    record.refresh_series_winner();

    let mut broadcasts = vec![ServerMessage::GameEnded(GameEnded {
        record: record.clone(),
        winner_team: winner,
    })];
    if record.has_winner {
        broadcasts.push(ServerMessage::MatchEnded(record.clone()));
    }

    ParseOutcome {
        record,
        changed: true,
        broadcasts,
        plugin: effects,
    }
}
