use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use sos_protocol::{Category, Coordinates, HelpRequest, NewRequests, RequestSource};
use tracing::info;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::auth::AuthContext;
use crate::error::Error;
use crate::event_bus::BusClient;
use crate::matching::{Dispatcher, validate};

#[derive(Debug, Deserialize)]
pub struct DirectRequestBody {
    pub category: Category,
    pub coordinates: Coordinates,
    #[serde(default)]
    pub location_text: Option<String>,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct DirectRequestResponse {
    pub success: bool,
    pub message: String,
    pub request_id: Uuid,
}

/// POST /api/v1/request/direct
pub async fn submit_direct_request(
    State(bus): State<BusClient>,
    Json(body): Json<DirectRequestBody>,
) -> Result<(StatusCode, Json<DirectRequestResponse>), ApiError> {
    validate::coordinates(&body.coordinates)?;
    let description = validate::description(&body.description)?;
    let location_text = validate::location_text(body.location_text.as_deref())?;

    let mut request = HelpRequest::new(
        RequestSource::DirectApp,
        body.category,
        description,
        body.coordinates,
    );
    request.location_text = location_text;

    bus.publish::<NewRequests>(&request)
        .await
        .map_err(Error::from)?;

    info!(request_id = %request.request_id, category = %request.category, "direct request received");
    Ok((
        StatusCode::ACCEPTED,
        Json(DirectRequestResponse {
            success: true,
            message: "Request received.".to_string(),
            request_id: request.request_id,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct AcceptResponse {
    pub success: bool,
    pub message: String,
    pub request_id: Uuid,
    pub volunteer_id: Uuid,
    pub assignment_id: Uuid,
}

/// POST /api/v1/requests/:request_id/accept
pub async fn accept_request(
    State(dispatcher): State<Dispatcher>,
    Extension(auth): Extension<AuthContext>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<AcceptResponse>, ApiError> {
    let volunteer_id = auth.require_volunteer()?;

    let assignment = dispatcher.accept(request_id, volunteer_id).await?;

    Ok(Json(AcceptResponse {
        success: true,
        message: "Request successfully assigned.".to_string(),
        request_id,
        volunteer_id,
        assignment_id: assignment.assignment_id,
    }))
}
