pub mod matches;
pub mod registry;
pub mod rooms;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::{
    config::AppConfig,
    services::{auth::Authenticator, event_parser::EventParser},
};

use self::{
    matches::MatchStore,
    registry::{ConnectionRegistry, Role},
    rooms::{RoomTable, Transport},
};

pub type SharedState = Arc<AppState>;

/// Central hub state: connection registry, match store and the transport they fan out through.
///
/// Lock order is `connections` before `matches`; neither lock is held while awaiting I/O.
pub struct AppState {
    config: Arc<AppConfig>,
    connections: RwLock<ConnectionRegistry>,
    matches: RwLock<MatchStore>,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    parser: EventParser,
    login_tickets: DashMap<String, Role>,
    telemetry_rejected: AtomicU64,
}

impl AppState {
    /// Construct a new [`AppState`] backed by the in-process [`RoomTable`].
    pub fn new(config: AppConfig, authenticator: Arc<dyn Authenticator>) -> SharedState {
        Self::with_transport(config, authenticator, Arc::new(RoomTable::new()))
    }

    /// Construct a new [`AppState`] on top of an arbitrary transport.
    pub fn with_transport(
        config: AppConfig,
        authenticator: Arc<dyn Authenticator>,
        transport: Arc<dyn Transport>,
    ) -> SharedState {
        let parser = EventParser::new(config.team_templates.clone());
        let matches = MatchStore::new(config.match_defaults);
        Arc::new(Self {
            config: Arc::new(config),
            connections: RwLock::new(ConnectionRegistry::new()),
            matches: RwLock::new(matches),
            transport,
            authenticator,
            parser,
            login_tickets: DashMap::new(),
            telemetry_rejected: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn connections(&self) -> &RwLock<ConnectionRegistry> {
        &self.connections
    }

    pub fn matches(&self) -> &RwLock<MatchStore> {
        &self.matches
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn parser(&self) -> &EventParser {
        &self.parser
    }

    /// Pending connections that asked for an HTTP login path, with the role they requested.
    pub fn login_tickets(&self) -> &DashMap<String, Role> {
        &self.login_tickets
    }

    /// Count a telemetry event that could not be decoded.
    pub fn record_rejected_telemetry(&self) -> u64 {
        self.telemetry_rejected.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn telemetry_rejected(&self) -> u64 {
        self.telemetry_rejected.load(Ordering::Relaxed)
    }
}
