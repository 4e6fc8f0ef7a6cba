use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sos_protocol::ChatSessionEstablished;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ConnectionHandle, fan_out};
use crate::event_bus::MessageHandler;

/// Every connected notification client receives every notification.
#[derive(Default)]
pub struct NotificationHub {
    connections: DashMap<Uuid, ConnectionHandle>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: ConnectionHandle) {
        debug!(connection_id = %conn.id(), "notification client registered");
        self.connections.insert(conn.id(), conn);
    }

    pub fn unregister(&self, connection_id: Uuid) -> bool {
        self.connections.remove(&connection_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send `text` to all clients in parallel, closing and removing the
    /// ones that fail.
    /// Returns how many received it.
    pub async fn broadcast(&self, text: Arc<str>) -> usize {
        let targets: Vec<ConnectionHandle> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        if targets.is_empty() {
            return 0;
        }

        let failed = fan_out(&targets, text).await;
        for connection_id in &failed {
            warn!(connection_id = %connection_id, "notification send failed, removing client");
            self.unregister(*connection_id);
        }
        targets.len() - failed.len()
    }
}

#[async_trait]
impl MessageHandler<ChatSessionEstablished> for NotificationHub {
    async fn handle(&self, notice: ChatSessionEstablished) -> anyhow::Result<()> {
        let text: Arc<str> = Arc::from(serde_json::to_string(&notice)?);
        let reached = self.broadcast(text).await;
        debug!(chat_room_id = %notice.chat_room_id, reached, "notification relayed");
        Ok(())
    }
}
