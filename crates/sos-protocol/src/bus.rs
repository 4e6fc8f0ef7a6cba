//! Typed bus topics.
//!
//! Every topic binds one topic name to exactly one payload type. Payloads
//! travel as JSON and are decoded once, at the subscription boundary.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Assignment, Availability, HelpRequest};

/// A named topic and the payload it carries.
pub trait Topic: Send + Sync + 'static {
    const NAME: &'static str;
    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// `sos-requests:new`: intake → matching engine.
pub struct NewRequests;

impl Topic for NewRequests {
    const NAME: &'static str = "sos-requests:new";
    type Payload = HelpRequest;
}

/// `volunteer:status`: verification → status cache consumers.
pub struct VolunteerStatusUpdates;

impl Topic for VolunteerStatusUpdates {
    const NAME: &'static str = "volunteer:status";
    type Payload = VolunteerStatusChanged;
}

/// `assignments:create`: matching engine → chat session manager.
pub struct AssignmentsCreated;

impl Topic for AssignmentsCreated {
    const NAME: &'static str = "assignments:create";
    type Payload = Assignment;
}

/// `system:notifications`: chat session manager → realtime gateway.
pub struct SystemNotifications;

impl Topic for SystemNotifications {
    const NAME: &'static str = "system:notifications";
    type Payload = ChatSessionEstablished;
}

/// Data for volunteer:status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolunteerStatusChanged {
    pub volunteer_id: Uuid,
    pub status: Availability,
    pub timestamp: DateTime<Utc>,
}

/// Data for system:notifications - a chat room is ready for both parties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSessionEstablished {
    pub chat_room_id: Uuid,
    pub assignment_id: Uuid,
    /// Lets the requester's client pick out its own notification.
    pub request_id: Uuid,
    /// Lets the volunteer's client pick out its own notification.
    pub volunteer_id: Uuid,
    pub requester_token: String,
    pub volunteer_token: String,
    pub timestamp: DateTime<Utc>,
}
