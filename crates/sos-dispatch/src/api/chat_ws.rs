use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::Utc;
use futures_util::StreamExt;
use sos_protocol::{ClientFrame, Party, ServerFrame};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::Rooms;
use crate::chat::ChatSessionManager;
use crate::config::GatewaySettings;
use crate::gateway::{CLOSE_UNAUTHORIZED, Member, connection, encode, spawn_writer};

const INVALID_JSON: &str = "Invalid JSON format.";
const INVALID_FRAME: &str = "Invalid message format. Send JSON with a non-empty 'text' field.";

/// WebSocket handler for a chat room
///
/// The room and token are checked before anything is exchanged. A failed
/// check still completes the upgrade so the client can be told why, via a
/// close frame with `CLOSE_UNAUTHORIZED`.
pub async fn ws_chat(
    ws: WebSocketUpgrade,
    State(chat): State<ChatSessionManager>,
    State(rooms): State<Rooms>,
    State(settings): State<GatewaySettings>,
    Path((room_id, token)): Path<(String, String)>,
) -> Response {
    let authorized = match Uuid::parse_str(&room_id) {
        Ok(room_id) => chat.authorize(room_id, &token).await.map(|party| (room_id, party)),
        Err(_) => None,
    };

    ws.on_upgrade(move |socket| async move {
        match authorized {
            Some((room_id, party)) => handle_chat(socket, rooms, settings, room_id, party).await,
            None => reject(socket, &room_id).await,
        }
    })
}

async fn reject(mut socket: WebSocket, room_id: &str) {
    warn!(chat_room_id = %room_id, "chat connection rejected, invalid room or token");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: "Unauthorized".into(),
        })))
        .await;
}

/// Text of a valid client frame, or the reason it is not one.
fn parse_client_frame(raw: &str) -> Result<String, &'static str> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|_| INVALID_JSON)?;
    match serde_json::from_value::<ClientFrame>(value) {
        Ok(frame) if !frame.text.trim().is_empty() => Ok(frame.text),
        _ => Err(INVALID_FRAME),
    }
}

async fn handle_chat(
    socket: WebSocket,
    rooms: Rooms,
    settings: GatewaySettings,
    room_id: Uuid,
    party: Party,
) {
    let (ws_tx, mut ws_rx) = socket.split();

    let (conn, outbound_rx) = connection(settings.outbound_buffer, settings.send_timeout());
    let writer = spawn_writer(ws_tx, outbound_rx);
    let connection_id = conn.id();

    rooms.join(
        room_id,
        Member {
            party,
            conn: conn.clone(),
        },
    );
    conn.send(encode(&ServerFrame::system(format!(
        "Welcome {party}, you are connected to chat room {room_id}."
    ))))
    .await;
    rooms
        .broadcast(
            room_id,
            &ServerFrame::system(format!("{} has joined the chat.", party.label())),
            Some(connection_id),
        )
        .await;

    info!(chat_room_id = %room_id, party = %party, "client connected to chat room");

    // Process inbound messages until the client leaves or the room evicts us
    loop {
        let msg = tokio::select! {
            _ = conn.closed() => {
                warn!(chat_room_id = %room_id, party = %party, "connection evicted, closing socket");
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match msg {
            Ok(Message::Text(text)) => match parse_client_frame(&text) {
                Ok(text) => {
                    let frame = ServerFrame::Chat {
                        sender: party,
                        text,
                        timestamp: Utc::now(),
                    };
                    rooms.broadcast(room_id, &frame, Some(connection_id)).await;
                }
                Err(reason) => {
                    debug!(chat_room_id = %room_id, party = %party, reason, "rejected client frame");
                    conn.send(encode(&ServerFrame::error(reason))).await;
                }
            },
            Ok(Message::Binary(_)) => {
                conn.send(encode(&ServerFrame::error(INVALID_FRAME))).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Ping/pong is handled by axum
            }
            Err(e) => {
                debug!(chat_room_id = %room_id, error = %e, "chat socket error");
                break;
            }
        }
    }

    rooms.leave(room_id, connection_id);
    rooms
        .broadcast(
            room_id,
            &ServerFrame::system(format!("{} has left the chat.", party.label())),
            None,
        )
        .await;

    writer.abort();
    info!(chat_room_id = %room_id, party = %party, "client disconnected from chat room");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_frame() {
        assert_eq!(parse_client_frame(r#"{"text":"hi"}"#), Ok("hi".to_string()));
        assert_eq!(
            parse_client_frame(r#"{"type":"chat","text":"hi"}"#),
            Ok("hi".to_string())
        );
        assert_eq!(parse_client_frame("not json"), Err(INVALID_JSON));
        assert_eq!(parse_client_frame(r#"{"message":"hi"}"#), Err(INVALID_FRAME));
        assert_eq!(parse_client_frame(r#"{"text":"   "}"#), Err(INVALID_FRAME));
        assert_eq!(parse_client_frame(r#"{"text":5}"#), Err(INVALID_FRAME));
    }
}
