//! WebSocket endpoint.
//!
//! Each connection gets a writer task draining its registry channel and a
//! reader loop feeding submissions to the dispatcher. Whichever way the
//! connection ends (close frame, read error, heartbeat termination) the same
//! cleanup runs: drop its waiting requests, then unregister.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chatrelay_core::{ConnectionId, RelayError, ServerMessage, Submission};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};

use crate::metrics;
use crate::registry::{ConnectionHandle, Outbound};
use crate::state::AppState;

/// WebSocket upgrade
///
/// GET /
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.is_origin_allowed(origin) {
        warn!(origin = origin.unwrap_or("<none>"), "Rejected connection from origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let ConnectionHandle { id, mut outbound, terminated } = state.registry.register();
    info!(connection = %id, "New WebSocket connection established");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: registry channel -> socket. Ends when the registry drops
    // the sender.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                Outbound::Text(text) => WsMessage::Text(text),
                Outbound::Ping => WsMessage::Ping(Vec::new()),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut forced = false;
    loop {
        tokio::select! {
            _ = terminated.notified() => {
                forced = true;
                break;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => on_frame(&state, id, &text),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => on_frame(&state, id, &text),
                    Err(_) => reject(&state, id, RelayError::InvalidJson),
                },
                Some(Ok(WsMessage::Pong(_))) => {
                    trace!(connection = %id, "Pong");
                    state.registry.mark_alive(&id);
                }
                Some(Ok(WsMessage::Ping(_))) => {} // answered by axum
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection = %id, error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    }

    let removed = state.dispatcher.connection_closed(&id);

    if forced {
        writer.abort();
    }
    info!(connection = %id, removed, forced, "WebSocket connection closed");
}

/// Validate and queue one inbound frame
fn on_frame(state: &Arc<AppState>, id: ConnectionId, text: &str) {
    let admitted = Submission::parse(text).and_then(|submission| {
        debug!(
            connection = %id,
            correlation_id = %submission.id,
            messages = submission.messages.len(),
            "Submission received"
        );
        state.dispatcher.submit(id, submission)
    });

    if let Err(err) = admitted {
        reject(state, id, err);
    }
}

fn reject(state: &AppState, id: ConnectionId, err: RelayError) {
    warn!(connection = %id, error = %err, "Rejected submission");
    metrics::record_rejected(err.kind());
    if let Some(message) = ServerMessage::from_error(&err) {
        state.registry.send_message(&id, &message);
    }
}
