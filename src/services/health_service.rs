use crate::{
    dto::health::HealthResponse,
    state::{SharedState, rooms::Transport},
};

/// Summarise hub load and the rejected-telemetry counter.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let connections = state.connections().read().await.len();
    let matches = state.matches().read().await.len();

    HealthResponse::ok(
        state.transport().connection_count(),
        connections,
        matches,
        state.telemetry_rejected(),
    )
}
