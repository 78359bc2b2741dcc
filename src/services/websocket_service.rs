use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{AckPayload, InboundFrame, ServerMessage},
    error::ServiceError,
    services::hub_service,
    state::{
        SharedState,
        rooms::{Attachment, Outbound, Transport, TransportExt},
    },
};

/// Handle the full lifecycle of one hub WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let connection_id = Uuid::new_v4().to_string();
    let Attachment {
        mut outbound,
        mut closed,
    } = state.transport().attach(&connection_id);
    let (mut sender, mut receiver) = socket.split();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    info!(id = %connection_id, "socket connected");

    loop {
        tokio::select! {
            biased;
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    debug!(id = %connection_id, "socket closed by hub");
                    break;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&state, &connection_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(id = %connection_id, "socket closed by client");
                    break;
                }
                Some(Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(err)) => {
                    warn!(id = %connection_id, error = %err, "websocket error");
                    break;
                }
            },
        }
    }

    hub_service::on_disconnect(&state, &connection_id).await;
    info!(id = %connection_id, "socket disconnected");

    // Detaching dropped the queue sender, so the writer drains what is left and stops.
    let _ = writer_task.await;
}

/// Decode, dispatch and acknowledge one text frame.
async fn handle_text(state: &SharedState, connection_id: &str, text: &str) {
    let frame = match InboundFrame::from_json_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(id = %connection_id, error = %err, "failed to parse hub message");
            if let Some(ack) = err.ack {
                let error = ServiceError::InvalidInput(err.reason);
                acknowledge(state, connection_id, ack, Err(error));
            }
            return;
        }
    };

    let result = hub_service::dispatch(state, connection_id, frame.message).await;
    match frame.ack {
        Some(ack) => acknowledge(state, connection_id, ack, result),
        None => {
            if let Err(err) = result {
                warn!(id = %connection_id, kind = err.kind(), error = %err, "message rejected");
            }
        }
    }
}

fn acknowledge(state: &SharedState, connection_id: &str, ack: u64, result: hub_service::Reply) {
    let payload = match result {
        Ok(data) => AckPayload {
            id: ack,
            ok: true,
            data,
            error: None,
        },
        Err(err) => {
            debug!(id = %connection_id, ack, kind = err.kind(), error = %err, "acknowledging failure");
            AckPayload {
                id: ack,
                ok: false,
                data: None,
                error: Some(err.to_body()),
            }
        }
    };
    state
        .transport()
        .send(connection_id, &ServerMessage::Ack(payload));
}
