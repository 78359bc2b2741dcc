//! In-memory match records keyed by group, with the merge helpers used by control boards.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::MatchDefaults;

/// Sentinel stored in `winner` while no team has won.
pub const NO_WINNER: i32 = -1;

/// Errors raised by [`MatchStore`] mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    /// The group has no match record.
    #[error("match `{0}` not found")]
    NotFound(String),
    /// Team index outside `[0, teams.len())`.
    #[error("team index {index} out of bounds (match has {len} teams)")]
    IndexOutOfBounds { index: i64, len: usize },
    /// The merged record would violate the match schema.
    #[error("invalid match data: {0}")]
    Invalid(String),
}

/// Authoritative series state for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    #[serde(rename = "group_id")]
    pub group_id: String,
    pub best_of: u32,
    pub team_size: u32,
    #[serde(default)]
    pub teams: Vec<Team>,
    pub winner: i32,
    pub has_winner: bool,
    /// Live game snapshot, present only while a game is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game: Option<GameSnapshot>,
    /// Operator-defined fields (titles, casters, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One team slot; `score` is per game, `series` counts games won in the match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub color_primary: String,
    #[serde(default)]
    pub color_secondary: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub series: u32,
    #[serde(default)]
    pub roster: Vec<String>,
    /// Live player stats from the active plugin.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub players: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Snapshot of the game currently being played in a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    #[serde(default = "no_winner")]
    pub winner: i32,
    #[serde(default)]
    pub has_winner: bool,
    #[serde(
        rename = "match_guid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub match_guid: Option<String>,
    /// Arena, ball, clock and any other title-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Default for GameSnapshot {
    fn default() -> Self {
        Self {
            winner: NO_WINNER,
            has_winner: false,
            match_guid: None,
            fields: Map::new(),
        }
    }
}

fn no_winner() -> i32 {
    NO_WINNER
}

/// Number of game wins needed to take a best-of-`best_of` series.
pub fn series_threshold(best_of: u32) -> u32 {
    best_of.div_ceil(2)
}

impl Match {
    /// Fresh record for `group_id` with no teams and no winner.
    pub fn new(group_id: impl Into<String>, defaults: MatchDefaults) -> Self {
        Self {
            group_id: group_id.into(),
            best_of: defaults.best_of,
            team_size: defaults.team_size,
            teams: Vec::new(),
            winner: NO_WINNER,
            has_winner: false,
            game: None,
            extra: Map::new(),
        }
    }

    /// Recompute `has_winner`/`winner` from the teams' series counts.
    ///
    /// A team that already holds the win keeps it as long as it still meets the threshold, so
    /// the first team to cross it stays the winner.
    pub fn refresh_series_winner(&mut self) {
        let threshold = series_threshold(self.best_of);
        if self.has_winner {
            let holder = usize::try_from(self.winner)
                .ok()
                .and_then(|index| self.teams.get(index));
            if holder.is_some_and(|team| team.series >= threshold) {
                return;
            }
        }

        match self.teams.iter().position(|team| team.series >= threshold) {
            Some(index) => {
                self.has_winner = true;
                self.winner = index as i32;
            }
            None => {
                self.has_winner = false;
                self.winner = NO_WINNER;
            }
        }
    }

    fn validate(&self) -> Result<(), MatchError> {
        if self.best_of == 0 || self.best_of % 2 == 0 {
            return Err(MatchError::Invalid(format!(
                "bestOf must be a positive odd number (got {})",
                self.best_of
            )));
        }
        if self.winner != NO_WINNER
            && usize::try_from(self.winner).map_or(true, |index| index >= self.teams.len())
        {
            return Err(MatchError::Invalid(format!(
                "winner {} does not reference a team",
                self.winner
            )));
        }
        Ok(())
    }
}

/// Merge `partial` into `target`: `null` removes the key, any other value replaces it.
fn merge_fields(target: &mut Map<String, Value>, partial: Map<String, Value>) {
    for (key, value) in partial {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>, MatchError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(MatchError::Invalid("record is not an object".into())),
        Err(err) => Err(MatchError::Invalid(err.to_string())),
    }
}

/// Table of matches keyed by group id, kept in creation order.
#[derive(Debug, Default)]
pub struct MatchStore {
    matches: IndexMap<String, Match>,
    defaults: MatchDefaults,
}

impl MatchStore {
    /// Empty store creating matches with `defaults`.
    pub fn new(defaults: MatchDefaults) -> Self {
        Self {
            matches: IndexMap::new(),
            defaults,
        }
    }

    pub fn get(&self, group_id: &str) -> Option<&Match> {
        self.matches.get(group_id)
    }

    pub fn get_mut(&mut self, group_id: &str) -> Option<&mut Match> {
        self.matches.get_mut(group_id)
    }

    /// Existing match for the group, or a new one with default settings.
    pub fn get_or_create(&mut self, group_id: &str) -> &mut Match {
        let defaults = self.defaults;
        self.matches
            .entry(group_id.to_string())
            .or_insert_with(|| Match::new(group_id, defaults))
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.matches.contains_key(group_id)
    }

    pub fn list(&self) -> Vec<Match> {
        self.matches.values().cloned().collect()
    }

    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.matches.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Replace the stored record for `record.group_id`.
    pub fn put(&mut self, record: Match) {
        self.matches.insert(record.group_id.clone(), record);
    }

    /// Merge operator-provided fields into a match.
    ///
    /// Explicit `null` deletes the key; deleted core fields fall back to their defaults. The
    /// group id is the routing key and is never changed. Nothing is written when the merged
    /// record fails validation.
    pub fn update(
        &mut self,
        group_id: &str,
        partial: Map<String, Value>,
    ) -> Result<Match, MatchError> {
        let current = self
            .matches
            .get(group_id)
            .ok_or_else(|| MatchError::NotFound(group_id.to_string()))?;

        let mut document = to_object(current)?;
        let mut partial = partial;
        partial.remove("group_id");
        merge_fields(&mut document, partial);

        for (key, value) in to_object(&Match::new(group_id, self.defaults))? {
            document.entry(key).or_insert(value);
        }

        let mut updated: Match = serde_json::from_value(Value::Object(document))
            .map_err(|err| MatchError::Invalid(err.to_string()))?;
        updated.refresh_series_winner();
        updated.validate()?;

        self.matches.insert(group_id.to_string(), updated.clone());
        Ok(updated)
    }

    /// Merge fields into the team at `index`, then re-evaluate the series winner.
    pub fn set_team(
        &mut self,
        group_id: &str,
        index: i64,
        partial: Map<String, Value>,
    ) -> Result<Team, MatchError> {
        let record = self
            .matches
            .get_mut(group_id)
            .ok_or_else(|| MatchError::NotFound(group_id.to_string()))?;

        let len = record.teams.len();
        let slot = usize::try_from(index)
            .ok()
            .filter(|slot| *slot < len)
            .ok_or(MatchError::IndexOutOfBounds { index, len })?;

        let mut document = to_object(&record.teams[slot])?;
        merge_fields(&mut document, partial);
        let team: Team = serde_json::from_value(Value::Object(document))
            .map_err(|err| MatchError::Invalid(err.to_string()))?;

        record.teams[slot] = team.clone();
        record.refresh_series_winner();
        Ok(team)
    }
}
