//! WebSocket handler for real-time sync.
//!
//! Handles WebSocket connections and dispatches messages to the same pull
//! and push handlers the HTTP routes use.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, ServerMessage};
use crate::AppState;

use super::{handle_pull, handle_push, PullQuery, PushRequest};

/// Handle an established WebSocket connection for `identity`.
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, identity: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connections = state.connections.clone();
    let conn_id = connections.register(identity.clone(), tx);

    tracing::info!(conn_id = %conn_id, identity = %identity, "WebSocket client connected");

    // Forward messages from the channel to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(&text, &state, &conn_id, &identity).await;
                connections.send_to(&conn_id, response);
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    connections.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        identity = %identity,
        active_connections = connections.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the reply.
async fn process_message(
    text: &str,
    state: &AppState,
    conn_id: &str,
    identity: &str,
) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::error(format!("Invalid message format: {}", e), None);
        }
    };

    match client_msg {
        ClientMessage::Pull {
            since,
            limit,
            request_id,
        } => match handle_pull(&state.pool, identity, PullQuery { since, limit }).await {
            Ok(response) => ServerMessage::PullResponse {
                events: response.events,
                has_more: response.has_more,
                server_timestamp: response.server_timestamp,
                request_id,
            },
            Err(e) => ServerMessage::error(e.to_string(), request_id),
        },

        ClientMessage::Push { events, request_id } => {
            let request = PushRequest { events };
            match handle_push(&state.pool, identity, state.config.max_push_batch, request).await {
                Ok(outcome) => {
                    let response = outcome.response;
                    if !outcome.recorded.is_empty() {
                        let notice =
                            ServerMessage::events_available(outcome.recorded, response.server_timestamp);
                        state.connections.broadcast(identity, Some(conn_id), &notice);
                    }
                    ServerMessage::PushResponse {
                        accepted: response.accepted,
                        conflicts: response.conflicts,
                        server_timestamp: response.server_timestamp,
                        request_id,
                    }
                }
                Err(e) => ServerMessage::error(e.to_string(), request_id),
            }
        }

        ClientMessage::Ping => ServerMessage::Pong,
    }
}
