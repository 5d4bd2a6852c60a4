//! Error responses for the admin routes.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use sparkle_cqrs_core::projection::ProjectionError;
use std::fmt;

/// An error rendered as `{"code", "message"}` with a matching status.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: &'static str,
}

impl AppError {
    /// Create an error.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
        }
    }

    /// 404 Not Found.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// 409 Conflict.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", message)
    }

    /// 503 Service Unavailable.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl From<ProjectionError> for AppError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::NotFound(_) => Self::not_found(err.to_string()),
            ProjectionError::AlreadyRegistered(_) | ProjectionError::InvalidTransition { .. } => {
                Self::conflict(err.to_string())
            }
            ProjectionError::InvalidPosition(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_POSITION",
                err.to_string(),
            ),
            _ => Self::internal(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = %self.status,
                code = self.code,
                message = %self.message,
                "Request failed"
            );
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkle_cqrs_core::projection::ProjectionStatus;

    #[test]
    fn test_error_display() {
        let err = AppError::conflict("already paused");
        assert_eq!(err.to_string(), "[CONFLICT] already paused");
    }

    #[test]
    fn test_projection_errors_map_to_statuses() {
        let status = |e: ProjectionError| AppError::from(e).status();
        assert_eq!(status(ProjectionError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(ProjectionError::InvalidTransition {
                name: "x".into(),
                from: ProjectionStatus::Error,
                to: ProjectionStatus::Paused,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(ProjectionError::InvalidPosition("1-0".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status(ProjectionError::Storage("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
