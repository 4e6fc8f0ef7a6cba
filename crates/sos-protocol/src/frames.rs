//! WebSocket frames exchanged with chat clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Party;

/// Message sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Welcome, join and leave notices
    System { message: String },
    /// A peer's chat message
    Chat {
        sender: Party,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Rejection of the client's last frame
    Error { message: String },
}

impl ServerFrame {
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Message sent from client to server. Any extra fields (such as
/// `"type": "chat"`) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub text: String,
}
