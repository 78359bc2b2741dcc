use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dto::ws::ErrorBody,
    services::auth::AuthError,
    state::{matches::MatchError, registry::RegistryError},
};

/// Errors returned by relay hub operations; none of them are fatal to the process.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed payload or missing required field.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Group assignment with an empty group name.
    #[error("group name must not be empty")]
    InvalidGroupName,
    /// Requested match or other resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Connection id is not registered.
    #[error("connection `{0}` not found")]
    ConnectionNotFound(String),
    /// Team index outside the match's team list.
    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: i64, len: usize },
    /// Credential rejected by the authenticator.
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    /// Operation not allowed for the caller's role or state.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Connection already completed a login.
    #[error("connection is already authenticated")]
    AlreadyAuthenticated,
}

impl ServiceError {
    /// Stable identifier sent to clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput(_) => "ValidationError",
            ServiceError::InvalidGroupName => "InvalidGroupName",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::ConnectionNotFound(_) => "ConnectionNotFound",
            ServiceError::IndexOutOfBounds { .. } => "IndexOutOfBounds",
            ServiceError::Unauthorized(_) => "AuthError",
            ServiceError::Forbidden(_) => "Forbidden",
            ServiceError::AlreadyAuthenticated => "AlreadyAuthenticated",
        }
    }

    /// Body used in WebSocket acknowledgements.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<MatchError> for ServiceError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::NotFound(group) => ServiceError::NotFound(format!("match `{group}`")),
            MatchError::IndexOutOfBounds { index, len } => {
                ServiceError::IndexOutOfBounds { index, len }
            }
            MatchError::Invalid(message) => ServiceError::InvalidInput(message),
        }
    }
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Duplicate(_) => ServiceError::AlreadyAuthenticated,
        }
    }
}

impl From<ValidationErrors> for ServiceError {
    fn from(err: ValidationErrors) -> Self {
        ServiceError::InvalidInput(format!("validation failed: {err}"))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Forbidden for the caller.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::InvalidInput(_)
            | ServiceError::InvalidGroupName
            | ServiceError::IndexOutOfBounds { .. } => AppError::BadRequest(message),
            ServiceError::NotFound(_) | ServiceError::ConnectionNotFound(_) => {
                AppError::NotFound(message)
            }
            ServiceError::Unauthorized(_) => AppError::Unauthorized(message),
            ServiceError::Forbidden(_) => AppError::Forbidden(message),
            ServiceError::AlreadyAuthenticated => AppError::Conflict(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
        };

        let payload = Json(ErrorResponse {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}
