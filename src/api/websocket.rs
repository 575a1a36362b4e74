//! UI websocket channel.
//!
//! A browser connects before starting a handshake and receives an opaque
//! client id; passing that id as `ws_client_id` on `/oauth/connect` routes
//! the terminal success or error event back to this socket.

use super::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// GET on the configured websockets path.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let client_id = Uuid::new_v4().to_string();
    let clients = state.engine.notifier.clients().clone();
    let mut rx = clients.register(&client_id);
    debug!(client_id = %client_id, "UI websocket connected");

    // First frame tells the client which id to attach to connect calls.
    let ack = json!({
        "message_type": "connection_ack",
        "ws_client_id": client_id,
    });
    if socket.send(Message::Text(ack.to_string())).await.is_err() {
        clients.unregister(&client_id);
        return;
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(payload) => {
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    // Inbound frames are ignored; the channel is one-way.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    clients.unregister(&client_id);
    debug!(client_id = %client_id, "UI websocket disconnected");
}
