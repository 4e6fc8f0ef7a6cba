use axum::http::StatusCode;
use sos_protocol::{Availability, Category, RequestStatus};
use thiserror::Error;

use crate::event_bus::BusError;
use crate::store::StoreError;

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication error: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    Rejected(#[from] Rejection),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            Error::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Rejected(rejection) => rejection.to_status_code(),
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to an API caller.
    pub fn reason(&self) -> String {
        match self {
            Error::Rejected(rejection) => rejection.to_string(),
            Error::Validation(msg)
            | Error::ConcurrencyConflict(msg)
            | Error::NotFound(msg)
            | Error::Unauthorized(msg) => msg.clone(),
            Error::DependencyUnavailable(_) => "Service temporarily unavailable.".to_string(),
            Error::Internal(_) => "An internal error occurred.".to_string(),
        }
    }
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Serialization(e) => Error::Internal(format!("bus payload serialization: {e}")),
            other => Error::DependencyUnavailable(other.to_string()),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Codec(e) => Error::Internal(format!("record codec: {e}")),
            duplicate @ StoreError::Duplicate { .. } => {
                Error::ConcurrencyConflict(duplicate.to_string())
            }
            other => Error::DependencyUnavailable(other.to_string()),
        }
    }
}

/// Why a manual accept was turned down. Checked in declaration order and
/// never accompanied by a state change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("Request not found.")]
    RequestNotFound,

    #[error("Request is already {0}.")]
    RequestNotAssignable(RequestStatus),

    #[error("Volunteer not found.")]
    VolunteerNotFound,

    #[error("Volunteer is not verified.")]
    VolunteerNotVerified,

    #[error("Volunteer is currently {0}.")]
    VolunteerUnavailable(Availability),

    #[error("Volunteer does not have the required skill ({0}).")]
    MissingSkill(Category),

    #[error("Volunteer became unavailable before assignment.")]
    VolunteerContended,

    #[error("Request was taken by another volunteer.")]
    RequestContended,
}

impl Rejection {
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Rejection::RequestNotFound | Rejection::VolunteerNotFound => StatusCode::NOT_FOUND,
            Rejection::RequestNotAssignable(_)
            | Rejection::VolunteerContended
            | Rejection::RequestContended => StatusCode::CONFLICT,
            Rejection::VolunteerNotVerified
            | Rejection::VolunteerUnavailable(_)
            | Rejection::MissingSkill(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// CAS losses, as opposed to failed preconditions.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Rejection::VolunteerContended | Rejection::RequestContended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_reasons_are_distinct() {
        let reasons = [
            Rejection::RequestNotFound,
            Rejection::RequestNotAssignable(RequestStatus::Assigned),
            Rejection::VolunteerNotFound,
            Rejection::VolunteerNotVerified,
            Rejection::VolunteerUnavailable(Availability::Busy),
            Rejection::MissingSkill(Category::Legal),
            Rejection::VolunteerContended,
            Rejection::RequestContended,
        ]
        .map(|r| r.to_string());

        for (i, a) in reasons.iter().enumerate() {
            for b in &reasons[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(reasons[1], "Request is already assigned.");
        assert_eq!(reasons[4], "Volunteer is currently busy.");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::from(Rejection::RequestContended).to_status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::DependencyUnavailable("bus".into()).to_status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::from(BusError::Unavailable).to_status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_dependency_reason_hides_details() {
        let err = Error::DependencyUnavailable("redis at 10.0.0.3 refused".into());
        assert_eq!(err.reason(), "Service temporarily unavailable.");
    }
}
