use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sos_domain::error::DomainError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found")]
    NotFound,
    #[error("{message}")]
    Conflict { code: &'static str, message: String },
    #[error("location unavailable: {0}")]
    LocationUnavailable(String),
    #[error("service unavailable")]
    Unavailable,
    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn in_progress() -> Self {
        ApiError::Conflict {
            code: "request_in_progress",
            message: "a request with this id is still being processed".into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::LocationUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden(_) => "not_authorized",
            ApiError::NotFound => "not_found",
            ApiError::Conflict { code, .. } => code,
            ApiError::LocationUnavailable(_) => "location_unavailable",
            ApiError::Unavailable => "unavailable",
            ApiError::Internal => "internal_error",
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        let code = err.kind();
        let message = err.to_string();
        match err {
            DomainError::Validation(message) => ApiError::Validation(message),
            DomainError::NotFound => ApiError::NotFound,
            DomainError::NotAuthorized(message) => ApiError::Forbidden(message),
            DomainError::LocationUnavailable(message) => ApiError::LocationUnavailable(message),
            DomainError::Unavailable(message) => {
                tracing::error!(error = %message, "store unavailable");
                ApiError::Unavailable
            }
            DomainError::Conflict
            | DomainError::DuplicateActiveRequest
            | DomainError::AlreadyClaimed
            | DomainError::InvalidTransition { .. }
            | DomainError::InvalidState(_) => ApiError::Conflict { code, message },
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.error_code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
