use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::hub::Envelope;
use crate::protocol::ClientMessage;
use crate::RelayState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    let limit = state.config.max_message_bytes;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// Handle a WebSocket connection from connect to disconnect.
async fn handle_socket(socket: WebSocket, state: RelayState, remote_addr: SocketAddr) {
    let registration = state.connections.register(Some(remote_addr));
    let connection_id = registration.connection_id;
    let mut rx = registration.receiver;
    let (mut sender, mut receiver) = socket.split();

    // Drain this connection's outbound queue into the socket
    let writer_connection = connection_id.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %writer_connection, "writer task finished");
    });

    info!(connection_id = %connection_id, remote_addr = %remote_addr, "client connected");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving message");
                break;
            }
        };

        let parsed = match frame {
            Message::Text(text) => serde_json::from_str::<ClientMessage>(&text),
            // Binary frames carrying JSON are accepted for clients that cannot send text
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => serde_json::from_str::<ClientMessage>(text),
                Err(_) => {
                    debug!(
                        connection_id = %connection_id,
                        bytes = data.len(),
                        "ignoring non-UTF8 binary frame"
                    );
                    continue;
                }
            },
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match parsed {
            Ok(message) => {
                debug!(connection_id = %connection_id, kind = message.kind(), "client message");
                state.dispatch(|hub| hub.handle(&connection_id, message));
            }
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "failed to parse client message");
                let reply = RelayError::InvalidMessage(err.to_string()).to_message();
                state.dispatch(|_| vec![Envelope::to(connection_id.clone(), reply)]);
            }
        }
    }

    // Clean up on disconnect. The transport is gone, so nothing is reported back to it.
    state.connections.unregister(&connection_id);
    state.dispatch(|hub| hub.disconnect(&connection_id));

    info!(connection_id = %connection_id, "client disconnected");
}
