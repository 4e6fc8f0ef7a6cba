use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::error::Error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                success: false,
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = e.to_status_code();
        if status.is_server_error() {
            error!(error = %e, "request failed");
        }
        Self {
            status,
            message: e.reason(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Rejection;

    #[test]
    fn test_rejection_maps_to_reason_and_status() {
        let api = ApiError::from(Error::from(Rejection::VolunteerContended));
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.message, "Volunteer became unavailable before assignment.");
    }

    #[test]
    fn test_internal_details_are_not_exposed() {
        let api = ApiError::from(Error::Internal("decode: trailing comma".into()));
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.message, "An internal error occurred.");
    }
}
