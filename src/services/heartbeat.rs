use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info};

use crate::{
    dto::ws::ServerMessage,
    state::{
        SharedState,
        rooms::{Transport, encode},
    },
};

/// Spawn the ticker pushing a heartbeat to every live socket.
pub fn spawn(state: SharedState) -> JoinHandle<()> {
    tokio::spawn(run(state))
}

/// Push `heartbeat` to every attached socket at the configured interval, forever.
pub async fn run(state: SharedState) {
    let Some(frame) = encode(&ServerMessage::Heartbeat) else {
        return;
    };
    let period = state.config().heartbeat_interval.max(Duration::from_millis(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_ms = period.as_millis() as u64, "heartbeat ticker started");

    loop {
        ticker.tick().await;
        let delivered = state.transport().broadcast_all_raw(frame.clone());
        if delivered > 0 {
            debug!(delivered, "heartbeat sent");
        }
    }
}
