use serde::Serialize;
use utoipa::ToSchema;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status, always "ok" while the hub serves requests.
    pub status: String,
    /// Open sockets, logged in or not.
    pub sockets: usize,
    /// Authenticated connections.
    pub connections: usize,
    /// Groups with a match record.
    pub matches: usize,
    /// Telemetry events dropped because they could not be decoded.
    pub telemetry_rejected: u64,
}

impl HealthResponse {
    /// Create a health response indicating the system is operational.
    pub fn ok(sockets: usize, connections: usize, matches: usize, telemetry_rejected: u64) -> Self {
        Self {
            status: "ok".to_string(),
            sockets,
            connections,
            matches,
            telemetry_rejected,
        }
    }
}
