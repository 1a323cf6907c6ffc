use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::routes::AppState;
use crate::transport::{ConnectionId, Frame};

/// WebSocket upgrade handler for the realtime channel.
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let connection = ConnectionId::new();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(state.channel_depth);

    if state.coordinator.connected(connection, tx).is_err() {
        warn!(connection_id = %connection, "coordinator stopped; refusing connection");
        return;
    }
    info!(connection_id = %connection, remote_addr = %remote_addr, "websocket connected");

    // The writer ends when the coordinator drops the queue's sender, or
    // when the socket refuses a frame. Either way the queue closes and the
    // coordinator sees a write failure on its next send.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        debug!(connection_id = %connection, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!(connection_id = %connection, "dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                debug!(
                    connection_id = %connection,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(connection_id = %connection, error = %err, "websocket receive error");
                break;
            }
        };

        if state.coordinator.message(connection, text).is_err() {
            break;
        }
    }

    let _ = state.coordinator.disconnected(connection);
    writer.abort();
    info!(connection_id = %connection, "websocket closed");
}
