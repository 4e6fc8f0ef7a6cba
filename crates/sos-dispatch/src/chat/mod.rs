//! Chat session lifecycle.
//!
//! Every published assignment gets a fresh room in the session store,
//! guarded by the assignment's two tokens and expiring after the configured
//! TTL. Once a room expires it is gone for good.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sos_protocol::{Assignment, ChatSessionEstablished, Party, SystemNotifications};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ChatSettings;
use crate::error::{Error, Result};
use crate::event_bus::{BusClient, MessageHandler};
use crate::store::SessionStore;

pub fn session_key(room_id: Uuid) -> String {
    format!("chat_session:{room_id}")
}

/// Room metadata as kept in the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub chat_room_id: Uuid,
    pub assignment_id: Uuid,
    pub request_id: Uuid,
    pub volunteer_id: Uuid,
    pub requester_token: String,
    pub volunteer_token: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl ChatSession {
    /// Which side `token` opens, if either.
    pub fn party_for(&self, token: &str) -> Option<Party> {
        if token == self.requester_token {
            Some(Party::Requester)
        } else if token == self.volunteer_token {
            Some(Party::Volunteer)
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct ChatSessionManager {
    sessions: Arc<dyn SessionStore>,
    bus: BusClient,
    settings: ChatSettings,
}

impl ChatSessionManager {
    pub fn new(sessions: Arc<dyn SessionStore>, bus: BusClient, settings: ChatSettings) -> Self {
        Self {
            sessions,
            bus,
            settings,
        }
    }

    /// Mint a room for `assignment`, store it, then announce it.
    ///
    /// The announcement only goes out once the room is stored: a client is
    /// never told about a room it could not get into. Every call mints a new
    /// room, including for an assignment seen before.
    pub async fn open_session(&self, assignment: &Assignment) -> Result<ChatSession> {
        let ttl = self.settings.session_ttl();
        let session = ChatSession {
            chat_room_id: Uuid::new_v4(),
            assignment_id: assignment.assignment_id,
            request_id: assignment.request_id,
            volunteer_id: assignment.volunteer_id,
            requester_token: assignment.requester_token.clone(),
            volunteer_token: assignment.volunteer_token.clone(),
            created_at: Utc::now(),
            ttl_seconds: ttl.as_secs(),
        };

        let raw = serde_json::to_string(&session)
            .map_err(|e| Error::Internal(format!("chat session encode: {e}")))?;
        self.sessions
            .set(&session_key(session.chat_room_id), raw, ttl)
            .await
            .inspect_err(|e| {
                error!(
                    assignment_id = %assignment.assignment_id,
                    error = %e,
                    "failed to store chat session, parties will not be notified"
                );
            })?;

        let established = ChatSessionEstablished {
            chat_room_id: session.chat_room_id,
            assignment_id: session.assignment_id,
            request_id: session.request_id,
            volunteer_id: session.volunteer_id,
            requester_token: session.requester_token.clone(),
            volunteer_token: session.volunteer_token.clone(),
            timestamp: session.created_at,
        };
        self.bus
            .publish::<SystemNotifications>(&established)
            .await
            .inspect_err(|e| {
                error!(
                    chat_room_id = %session.chat_room_id,
                    error = %e,
                    "failed to announce chat session"
                );
            })?;

        info!(
            chat_room_id = %session.chat_room_id,
            assignment_id = %session.assignment_id,
            ttl_seconds = session.ttl_seconds,
            "chat session established"
        );
        Ok(session)
    }

    pub async fn session(&self, room_id: Uuid) -> Result<Option<ChatSession>> {
        let Some(raw) = self.sessions.get(&session_key(room_id)).await? else {
            return Ok(None);
        };
        let session = serde_json::from_str(&raw)
            .map_err(|e| Error::Internal(format!("chat session decode: {e}")))?;
        Ok(Some(session))
    }

    /// The party `token` belongs to in `room_id`. `None` for an unknown or
    /// expired room, a foreign token, or a store that cannot be reached.
    pub async fn authorize(&self, room_id: Uuid, token: &str) -> Option<Party> {
        match self.session(room_id).await {
            Ok(Some(session)) => session.party_for(token),
            Ok(None) => None,
            Err(e) => {
                warn!(chat_room_id = %room_id, error = %e, "chat authorization lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl MessageHandler<Assignment> for ChatSessionManager {
    async fn handle(&self, assignment: Assignment) -> anyhow::Result<()> {
        self.open_session(&assignment).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::BusSettings;
    use crate::event_bus::MemoryTransport;
    use crate::store::MemorySessionStore;

    struct Collect(mpsc::UnboundedSender<ChatSessionEstablished>);

    #[async_trait]
    impl MessageHandler<ChatSessionEstablished> for Collect {
        async fn handle(&self, payload: ChatSessionEstablished) -> anyhow::Result<()> {
            self.0.send(payload)?;
            Ok(())
        }
    }

    async fn manager(
        sessions: Arc<MemorySessionStore>,
    ) -> (ChatSessionManager, mpsc::UnboundedReceiver<ChatSessionEstablished>) {
        let bus = BusClient::new(Arc::new(MemoryTransport::default()), BusSettings::default());
        bus.connect().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe::<SystemNotifications, _>(Arc::new(Collect(tx)))
            .await
            .unwrap();

        let settings = ChatSettings {
            session_ttl_hours: 1,
        };
        (ChatSessionManager::new(sessions, bus, settings), rx)
    }

    fn assignment() -> Assignment {
        Assignment::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_open_session_stores_then_announces() {
        let sessions = Arc::new(MemorySessionStore::new());
        let (chat, mut rx) = manager(sessions.clone()).await;
        let a = assignment();

        let session = chat.open_session(&a).await.unwrap();

        let established = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(established.chat_room_id, session.chat_room_id);
        assert_eq!(established.requester_token, a.requester_token);
        assert_eq!(established.volunteer_token, a.volunteer_token);
        assert!(sessions
            .get(&session_key(session.chat_room_id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_authorize_resolves_each_token_to_its_party() {
        let (chat, _rx) = manager(Arc::new(MemorySessionStore::new())).await;
        let a = assignment();
        let session = chat.open_session(&a).await.unwrap();
        let other = chat.open_session(&assignment()).await.unwrap();
        let room = session.chat_room_id;

        assert_eq!(chat.authorize(room, &a.requester_token).await, Some(Party::Requester));
        assert_eq!(chat.authorize(room, &a.volunteer_token).await, Some(Party::Volunteer));
        assert_eq!(chat.authorize(room, "not-a-token").await, None);
        // Tokens never open another room.
        assert_eq!(chat.authorize(other.chat_room_id, &a.requester_token).await, None);
        assert_eq!(chat.authorize(Uuid::new_v4(), &a.requester_token).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_stop_working_when_the_room_expires() {
        let (chat, _rx) = manager(Arc::new(MemorySessionStore::new())).await;
        let a = assignment();
        let room = chat.open_session(&a).await.unwrap().chat_room_id;

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert_eq!(chat.authorize(room, &a.volunteer_token).await, Some(Party::Volunteer));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(chat.authorize(room, &a.volunteer_token).await, None);
    }

    #[tokio::test]
    async fn test_store_failure_withholds_announcement() {
        let sessions = Arc::new(MemorySessionStore::new());
        sessions.set_available(false);
        let (chat, mut rx) = manager(sessions).await;

        let err = chat.open_session(&assignment()).await.unwrap_err();

        assert!(matches!(err, Error::DependencyUnavailable(_)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_assignment_opens_two_rooms() {
        let (chat, _rx) = manager(Arc::new(MemorySessionStore::new())).await;
        let a = assignment();

        let first = chat.open_session(&a).await.unwrap();
        let second = chat.open_session(&a).await.unwrap();

        assert_ne!(first.chat_room_id, second.chat_room_id);
        assert_eq!(first.assignment_id, second.assignment_id);
    }
}
