//! Mapping of domain errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::domain::errors::DomainError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match &self.0 {
            DomainError::DependencyCycle(_)
            | DomainError::InvalidStateTransition { .. }
            | DomainError::MergeConflict { .. }
            | DomainError::ClaimConflict(_)
            | DomainError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            DomainError::UnknownAgent(_)
            | DomainError::TaskNotFound(_)
            | DomainError::TicketNotFound(_)
            | DomainError::MergeUnitNotFound(_) => StatusCode::NOT_FOUND,
            DomainError::ValidationFailed(_)
            | DomainError::UnknownDependency { .. }
            | DomainError::UnknownRef(_) => StatusCode::BAD_REQUEST,
            DomainError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DomainError::StaleAgent { .. }
            | DomainError::MergeBackend(_)
            | DomainError::DatabaseError(_)
            | DomainError::SerializationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.code(), "request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DomainError::DependencyCycle(vec![]), StatusCode::CONFLICT),
            (DomainError::UnknownAgent("a".into()), StatusCode::NOT_FOUND),
            (DomainError::TaskNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (DomainError::ValidationFailed("x".into()), StatusCode::BAD_REQUEST),
            (
                DomainError::CircuitOpen {
                    scope: "merge:main".into(),
                    retry_after: chrono::Utc::now(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (DomainError::DatabaseError("locked".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
