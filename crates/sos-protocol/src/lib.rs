//! Shared record, bus payload and WebSocket frame definitions.
//!
//! Used by the dispatch server and by any client that talks to it over the
//! bus or the realtime gateway.

pub mod bus;
pub mod frames;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::{
    AssignmentsCreated, ChatSessionEstablished, NewRequests, SystemNotifications, Topic,
    VolunteerStatusChanged, VolunteerStatusUpdates,
};
pub use frames::{ClientFrame, ServerFrame};

const EARTH_RADIUS_KM: f64 = 6371.0088;

// ============================================================================
// Category
// ============================================================================

/// Skill domain a request needs and a volunteer offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Medical,
    Legal,
    Shelter,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Medical => "Medical",
            Category::Legal => "Legal",
            Category::Shelter => "Shelter",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Coordinates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Latitude within [-90, 90] and longitude within [-180, 180].
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let d_lat = lat2 - lat1;
        let d_lng = (other.lng - self.lng).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

// ============================================================================
// Help requests
// ============================================================================

/// Lifecycle of a help request.
///
/// `pending` moves to either `pending_manual_assignment` (nobody nearby) or
/// `assigned`. Requests are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    PendingManualAssignment,
    Assigned,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::PendingManualAssignment => "pending_manual_assignment",
            RequestStatus::Assigned => "assigned",
        }
    }

    /// Whether a volunteer may still take this request.
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            RequestStatus::Pending | RequestStatus::PendingManualAssignment
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestSource {
    DirectApp,
    Twitter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpRequest {
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub source: RequestSource,
    pub category: Category,
    /// Free-text description of what is needed.
    pub description: String,
    /// Optional human description of the place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_text: Option<String>,
    pub coordinates: Coordinates,
    #[serde(default)]
    pub status: RequestStatus,
    /// Set once the request is assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_volunteer_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_updated_at: Option<DateTime<Utc>>,
}

impl HelpRequest {
    /// Build a fresh `pending` request.
    pub fn new(
        source: RequestSource,
        category: Category,
        description: impl Into<String>,
        coordinates: Coordinates,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            created_at: Utc::now(),
            source,
            category,
            description: description.into(),
            location_text: None,
            coordinates,
            status: RequestStatus::Pending,
            assignment_id: None,
            assigned_volunteer_id: None,
            status_updated_at: None,
        }
    }
}

// ============================================================================
// Volunteers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Offline,
    Available,
    Busy,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Offline => "offline",
            Availability::Available => "available",
            Availability::Busy => "busy",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volunteer {
    pub volunteer_id: Uuid,
    pub name: String,
    pub phone_number: String,
    pub skills: Vec<Category>,
    /// One-time code handed out by the coordinating organization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_code: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub status: Availability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<Coordinates>,
    /// Request that moved this volunteer to `busy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assigned_request_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_updated_at: Option<DateTime<Utc>>,
}

impl Volunteer {
    pub fn has_skill(&self, category: Category) -> bool {
        self.skills.contains(&category)
    }
}

// ============================================================================
// Assignments
// ============================================================================

/// Which side of a chat room a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Requester,
    Volunteer,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Requester => "requester",
            Party::Volunteer => "volunteer",
        }
    }

    /// Capitalized label used in human-facing notices.
    pub fn label(&self) -> &'static str {
        match self {
            Party::Requester => "Requester",
            Party::Volunteer => "Volunteer",
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pairs one request with one volunteer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: Uuid,
    pub request_id: Uuid,
    pub volunteer_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Authorizes the requester side of the chat room only.
    pub requester_token: String,
    /// Authorizes the volunteer side of the chat room only.
    pub volunteer_token: String,
}

impl Assignment {
    /// New assignment with a fresh id and a fresh, distinct token pair.
    pub fn new(request_id: Uuid, volunteer_id: Uuid) -> Self {
        Self {
            assignment_id: Uuid::new_v4(),
            request_id,
            volunteer_id,
            created_at: Utc::now(),
            requester_token: mint_token(),
            volunteer_token: mint_token(),
        }
    }

    pub fn token_for(&self, party: Party) -> &str {
        match party {
            Party::Requester => &self.requester_token,
            Party::Volunteer => &self.volunteer_token,
        }
    }
}

/// Opaque random bearer token.
pub fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}
