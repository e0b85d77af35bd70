use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::rooms::{Connection, RoomBroadcaster, ServerMessage};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Stable id surviving reconnects; enables the deferred leave.
    #[serde(default, rename = "clientId")]
    pub client_id: Option<String>
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe { room: String },
    Unsubscribe { room: String },
    Status { room: String }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.rooms, params.client_id))
}

async fn handle_socket(socket: WebSocket, rooms: Arc<RoomBroadcaster>, client_id: Option<String>) {
    let (conn, mut rx) = Connection::channel(client_id);
    tracing::info!(conn_id = %conn.id(), client_id = ?conn.client_id(), "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn.id().to_string();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(conn_id = %sender_conn_id, "failed to encode message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => handle_message(&rooms, &conn, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn.id(), error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Closing the socket is not an unsubscribe; memberships go through the
    // grace window so a reload can pick them up again.
    send_task.abort();
    rooms.disconnect(&conn);
    tracing::info!(conn_id = %conn.id(), "WebSocket disconnected");
}

fn handle_message(rooms: &RoomBroadcaster, conn: &Connection, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            conn.send(ServerMessage::Error {
                message: format!("invalid message: {e}")
            });
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { room } | ClientMessage::Unsubscribe { room } | ClientMessage::Status { room }
            if room.trim().is_empty() =>
        {
            conn.send(ServerMessage::Error {
                message: "room must not be empty".to_string()
            });
        }
        ClientMessage::Subscribe { room } => {
            tracing::debug!(conn_id = %conn.id(), room = %room, "subscribe");
            rooms.subscribe(&room, conn);
        }
        ClientMessage::Unsubscribe { room } => {
            tracing::debug!(conn_id = %conn.id(), room = %room, "unsubscribe");
            rooms.unsubscribe(&room, conn);
        }
        ClientMessage::Status { room } => {
            rooms.request_status(&room, conn);
        }
    }
}
