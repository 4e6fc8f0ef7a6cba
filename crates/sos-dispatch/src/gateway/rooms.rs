use dashmap::DashMap;
use sos_protocol::{Party, ServerFrame};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ConnectionHandle, encode, fan_out};

/// One live connection in a chat room.
#[derive(Debug, Clone)]
pub struct Member {
    pub party: Party,
    pub conn: ConnectionHandle,
}

/// Live chat connections keyed by room. A room exists only while it has
/// members; nothing is retained once the last one leaves.
#[derive(Default)]
pub struct ChatRooms {
    rooms: DashMap<Uuid, Vec<Member>>,
}

impl ChatRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room_id: Uuid, member: Member) {
        debug!(chat_room_id = %room_id, party = %member.party, "member joined room");
        self.rooms.entry(room_id).or_default().push(member);
    }

    /// Remove a connection. Returns whether it was still a member.
    pub fn leave(&self, room_id: Uuid, connection_id: Uuid) -> bool {
        let mut removed = false;
        if let Some(mut members) = self.rooms.get_mut(&room_id) {
            let before = members.len();
            members.retain(|m| m.conn.id() != connection_id);
            removed = members.len() < before;
        }
        if self.rooms.remove_if(&room_id, |_, members| members.is_empty()).is_some() {
            info!(chat_room_id = %room_id, "chat room empty, discarded");
        }
        removed
    }

    pub fn member_count(&self, room_id: Uuid) -> usize {
        self.rooms.get(&room_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Send `frame` to every member except `exclude`. Recipients are a
    /// snapshot taken now; members whose send fails are closed and dropped
    /// from the room. Returns how many members the frame reached.
    pub async fn broadcast(&self, room_id: Uuid, frame: &ServerFrame, exclude: Option<Uuid>) -> usize {
        let targets: Vec<ConnectionHandle> = match self.rooms.get(&room_id) {
            Some(members) => members
                .iter()
                .filter(|m| Some(m.conn.id()) != exclude)
                .map(|m| m.conn.clone())
                .collect(),
            None => return 0,
        };
        if targets.is_empty() {
            return 0;
        }

        let failed = fan_out(&targets, encode(frame)).await;
        for connection_id in &failed {
            warn!(
                chat_room_id = %room_id,
                connection_id = %connection_id,
                "send failed, removing connection from room"
            );
            self.leave(room_id, *connection_id);
        }
        targets.len() - failed.len()
    }
}
