//! Application-level configuration loading, including match defaults, team templates and
//! the accounts accepted by the password login flow.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/relay.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "RELAY_CONFIG_PATH";
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 100;
const DEFAULT_RATE_WINDOW_MS: u64 = 1000;
const DEFAULT_AVATAR: &str = "https://www.dropbox.com/s/vr7lbsauae31am6/rl-logo.png?dl=1";

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Interval between two heartbeat pushes to every live connection.
    pub heartbeat_interval: Duration,
    /// Delay after which a telemetry event stops counting towards a plugin's rate.
    pub rate_window: Duration,
    /// Group overlays and plugins are routed to right after login, if any.
    pub default_group: Option<String>,
    /// Values used when a match is lazily created.
    pub match_defaults: MatchDefaults,
    /// Ordered templates used when telemetry needs team slots that do not exist yet.
    pub team_templates: Vec<TeamTemplate>,
    /// Accounts accepted by the password login flow.
    pub accounts: Vec<Account>,
}

/// Series settings applied to freshly created matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MatchDefaults {
    /// Series length, always odd.
    pub best_of: u32,
    /// Players per team, informational only.
    pub team_size: u32,
}

impl Default for MatchDefaults {
    fn default() -> Self {
        Self {
            best_of: 5,
            team_size: 3,
        }
    }
}

/// Presentation defaults for a team slot created from telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TeamTemplate {
    pub name: String,
    #[serde(default = "default_avatar")]
    pub avatar: String,
    pub color_primary: String,
    pub color_secondary: String,
}

/// Operator account that may redeem a login ticket with email and password.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub email: String,
    pub display_name: String,
    /// Argon2 PHC string.
    pub password_hash: String,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        accounts = app_config.accounts.len(),
                        templates = app_config.team_templates.len(),
                        "loaded relay configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            rate_window: Duration::from_millis(DEFAULT_RATE_WINDOW_MS),
            default_group: None,
            match_defaults: MatchDefaults::default(),
            team_templates: default_team_templates(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde(default)]
    heartbeat_interval_ms: Option<u64>,
    #[serde(default)]
    rate_window_ms: Option<u64>,
    #[serde(default)]
    default_group: Option<String>,
    #[serde(default)]
    match_defaults: Option<MatchDefaults>,
    #[serde(default)]
    team_templates: Option<Vec<TeamTemplate>>,
    #[serde(default)]
    accounts: Vec<Account>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let mut match_defaults = value.match_defaults.unwrap_or_default();
        if match_defaults.best_of % 2 == 0 {
            warn!(
                best_of = match_defaults.best_of,
                "configured best_of must be odd; using default"
            );
            match_defaults.best_of = MatchDefaults::default().best_of;
        }

        Self {
            heartbeat_interval: Duration::from_millis(
                value
                    .heartbeat_interval_ms
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
            ),
            rate_window: Duration::from_millis(
                value
                    .rate_window_ms
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_RATE_WINDOW_MS),
            ),
            default_group: value
                .default_group
                .map(|group| group.trim().to_string())
                .filter(|group| !group.is_empty()),
            match_defaults,
            team_templates: value
                .team_templates
                .filter(|templates| !templates.is_empty())
                .unwrap_or_else(default_team_templates),
            accounts: value.accounts,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn default_avatar() -> String {
    DEFAULT_AVATAR.to_string()
}

/// Built-in team templates, alternating blue and orange.
fn default_team_templates() -> Vec<TeamTemplate> {
    vec![
        TeamTemplate {
            name: "Blue Team".into(),
            avatar: default_avatar(),
            color_primary: "#1873FF".into(),
            color_secondary: "#0B3D91".into(),
        },
        TeamTemplate {
            name: "Orange Team".into(),
            avatar: default_avatar(),
            color_primary: "#FF8C1A".into(),
            color_secondary: "#B35900".into(),
        },
    ]
}
