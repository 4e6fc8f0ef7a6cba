use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use sos_protocol::{Availability, HelpRequest, RequestStatus, Volunteer};
use uuid::Uuid;

use super::documents::{Document, DocumentStore, Filter, Sort};
use super::{StoreError, StoreResult};

pub const REQUESTS: &str = "help_requests";
pub const VOLUNTEERS: &str = "volunteers";

/// Typed access to request and volunteer records.
///
/// Every status change goes through a conditional update whose filter pins
/// the expected prior state. Nothing here overwrites a status
/// unconditionally.
#[derive(Clone)]
pub struct Records {
    documents: Arc<dyn DocumentStore>,
}

pub(crate) fn to_document<T: Serialize>(value: &T) -> StoreResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Codec(serde::ser::Error::custom(format!(
            "expected an object, got {other}"
        )))),
    }
}

pub(crate) fn from_document<T: DeserializeOwned>(doc: Document) -> StoreResult<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

fn patch(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn statuses_json(from: &[RequestStatus]) -> Vec<Value> {
    from.iter().map(|s| json!(s)).collect()
}

impl Records {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    // ------------------------------------------------------------------------
    // Help requests
    // ------------------------------------------------------------------------

    /// Persist a new request. A request id seen before is refused with
    /// `StoreError::Duplicate`.
    pub async fn insert_request(&self, request: &HelpRequest) -> StoreResult<()> {
        self.documents
            .insert_unique(REQUESTS, "request_id", to_document(request)?)
            .await
    }

    pub async fn get_request(&self, request_id: Uuid) -> StoreResult<Option<HelpRequest>> {
        let filter = Filter::new().eq("request_id", json!(request_id));
        self.documents
            .find_one(REQUESTS, &filter)
            .await?
            .map(from_document)
            .transpose()
    }

    /// Requests in one of `statuses`, newest first.
    pub async fn recent_requests(
        &self,
        statuses: &[RequestStatus],
        limit: usize,
    ) -> StoreResult<Vec<HelpRequest>> {
        let filter = Filter::new().any_of("status", statuses_json(statuses));
        self.documents
            .find(REQUESTS, &filter, Some(&Sort::desc("created_at")), Some(limit))
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    /// Move a request to `to` if it is currently in one of `from`.
    pub async fn transition_request(
        &self,
        request_id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> StoreResult<bool> {
        let filter = Filter::new()
            .eq("request_id", json!(request_id))
            .any_of("status", statuses_json(from));
        let update = patch(json!({
            "status": to,
            "status_updated_at": Utc::now(),
        }));
        self.documents.compare_and_swap(REQUESTS, &filter, update).await
    }

    /// Record the assignment on a request still in one of `from`.
    pub async fn mark_assigned(
        &self,
        request_id: Uuid,
        from: &[RequestStatus],
        assignment_id: Uuid,
        volunteer_id: Uuid,
    ) -> StoreResult<bool> {
        let filter = Filter::new()
            .eq("request_id", json!(request_id))
            .any_of("status", statuses_json(from));
        let update = patch(json!({
            "status": RequestStatus::Assigned,
            "assignment_id": assignment_id,
            "assigned_volunteer_id": volunteer_id,
            "status_updated_at": Utc::now(),
        }));
        self.documents.compare_and_swap(REQUESTS, &filter, update).await
    }

    /// Undo `mark_assigned` for exactly this assignment.
    pub async fn revert_assignment(
        &self,
        request_id: Uuid,
        assignment_id: Uuid,
        restore: RequestStatus,
    ) -> StoreResult<bool> {
        let filter = Filter::new()
            .eq("request_id", json!(request_id))
            .eq("status", json!(RequestStatus::Assigned))
            .eq("assignment_id", json!(assignment_id));
        let update = patch(json!({
            "status": restore,
            "assignment_id": null,
            "assigned_volunteer_id": null,
            "status_updated_at": Utc::now(),
        }));
        self.documents.compare_and_swap(REQUESTS, &filter, update).await
    }

    // ------------------------------------------------------------------------
    // Volunteers
    // ------------------------------------------------------------------------

    pub async fn insert_volunteer(&self, volunteer: &Volunteer) -> StoreResult<()> {
        self.documents
            .insert_unique(VOLUNTEERS, "volunteer_id", to_document(volunteer)?)
            .await
    }

    pub async fn get_volunteer(&self, volunteer_id: Uuid) -> StoreResult<Option<Volunteer>> {
        let filter = Filter::new().eq("volunteer_id", json!(volunteer_id));
        self.documents
            .find_one(VOLUNTEERS, &filter)
            .await?
            .map(from_document)
            .transpose()
    }

    pub async fn find_volunteer_by_code(&self, code: &str) -> StoreResult<Option<Volunteer>> {
        let filter = Filter::new().eq("verification_code", json!(code));
        self.documents
            .find_one(VOLUNTEERS, &filter)
            .await?
            .map(from_document)
            .transpose()
    }

    /// `available → busy`, remembering which request caused it. Fails if the
    /// volunteer is no longer available.
    pub async fn claim_volunteer(&self, volunteer_id: Uuid, request_id: Uuid) -> StoreResult<bool> {
        let filter = Filter::new()
            .eq("volunteer_id", json!(volunteer_id))
            .eq("status", json!(Availability::Available));
        let update = patch(json!({
            "status": Availability::Busy,
            "last_assigned_request_id": request_id,
            "status_updated_at": Utc::now(),
        }));
        self.documents.compare_and_swap(VOLUNTEERS, &filter, update).await
    }

    /// `busy → available`, but only if the volunteer is still busy with
    /// `request_id`.
    pub async fn release_volunteer(&self, volunteer_id: Uuid, request_id: Uuid) -> StoreResult<bool> {
        let filter = Filter::new()
            .eq("volunteer_id", json!(volunteer_id))
            .eq("status", json!(Availability::Busy))
            .eq("last_assigned_request_id", json!(request_id));
        let update = patch(json!({
            "status": Availability::Available,
            "last_assigned_request_id": null,
            "status_updated_at": Utc::now(),
        }));
        self.documents.compare_and_swap(VOLUNTEERS, &filter, update).await
    }

    /// Mark an unverified volunteer verified and available.
    pub async fn verify_volunteer(&self, volunteer_id: Uuid) -> StoreResult<bool> {
        let filter = Filter::new()
            .eq("volunteer_id", json!(volunteer_id))
            .eq("is_verified", json!(false));
        let update = patch(json!({
            "is_verified": true,
            "status": Availability::Available,
            "status_updated_at": Utc::now(),
        }));
        self.documents.compare_and_swap(VOLUNTEERS, &filter, update).await
    }
}
