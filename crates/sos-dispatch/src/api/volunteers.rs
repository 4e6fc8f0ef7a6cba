use axum::Json;
use axum::extract::State;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sos_protocol::{Availability, VolunteerStatusChanged, VolunteerStatusUpdates};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::auth::LoginSessions;
use crate::error::Error;
use crate::event_bus::BusClient;
use crate::matching::validate;
use crate::store::Records;

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub verification_code: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub message: String,
    pub volunteer_id: Uuid,
    /// Bearer token for volunteer-only endpoints.
    pub session_token: String,
    pub expires_in_seconds: u64,
}

/// POST /api/v1/volunteer/verify
///
/// Verifies the volunteer holding the code (first time only) and logs them
/// in either way.
pub async fn verify_volunteer(
    State(records): State<Records>,
    State(logins): State<LoginSessions>,
    State(bus): State<BusClient>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let code = validate::verification_code(&body.verification_code)?;
    let volunteer = records
        .find_volunteer_by_code(&code)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::Validation("Invalid verification code.".to_string()))?;
    let volunteer_id = volunteer.volunteer_id;

    let message = if volunteer.is_verified {
        "Volunteer already verified."
    } else {
        if records
            .verify_volunteer(volunteer_id)
            .await
            .map_err(Error::from)?
        {
            info!(volunteer_id = %volunteer_id, "volunteer verified");
            let update = VolunteerStatusChanged {
                volunteer_id,
                status: Availability::Available,
                timestamp: Utc::now(),
            };
            if let Err(e) = bus.publish::<VolunteerStatusUpdates>(&update).await {
                warn!(volunteer_id = %volunteer_id, error = %e, "failed to publish volunteer status");
            }
        }
        "Verification successful."
    };

    let session_token = logins.issue(volunteer_id).await?;

    Ok(Json(VerifyResponse {
        success: true,
        message: message.to_string(),
        volunteer_id,
        session_token,
        expires_in_seconds: logins.ttl().as_secs(),
    }))
}
