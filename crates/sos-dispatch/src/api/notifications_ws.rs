use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::Hub;
use crate::config::GatewaySettings;
use crate::gateway::{connection, spawn_writer};

/// WebSocket handler for system notifications. Unauthenticated and
/// receive-only: inbound frames are read and discarded. The socket is
/// dropped once the hub evicts the client.
pub async fn ws_notifications(
    ws: WebSocketUpgrade,
    State(hub): State<Hub>,
    State(settings): State<GatewaySettings>,
) -> Response {
    ws.on_upgrade(move |socket| handle_notifications(socket, hub, settings))
}

async fn handle_notifications(socket: WebSocket, hub: Hub, settings: GatewaySettings) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (conn, outbound_rx) = connection(settings.outbound_buffer, settings.send_timeout());
    let writer = spawn_writer(ws_tx, outbound_rx);
    let connection_id = conn.id();

    hub.register(conn.clone());
    info!(connection_id = %connection_id, clients = hub.len(), "notification client connected");

    loop {
        tokio::select! {
            _ = conn.closed() => {
                warn!(connection_id = %connection_id, "notification client evicted, closing socket");
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unregister(connection_id);
    writer.abort();
    info!(connection_id = %connection_id, "notification client disconnected");
}
