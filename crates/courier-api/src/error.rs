//! HTTP error responses.
//!
//! Every failing handler returns `ApiError`, rendered as
//! `{"error": {"code": "...", "message": "..."}}` with a matching status.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::CoreError;
use courier_delivery::{AdminError, EnqueueError};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors surfaced by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request was rejected before anything was written.
    #[error("{0}")]
    Validation(String),

    /// Request body, path or query could not be parsed.
    #[error("{0}")]
    BadRequest(String),

    /// Requested entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Action is not valid in the entity's current state.
    #[error("{0}")]
    InvalidState(String),

    /// Job store could not be reached.
    #[error("job store unavailable")]
    Unavailable(String),
}

impl ApiError {
    /// Error code from the API taxonomy.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "E1001",
            Self::BadRequest(_) => "E1002",
            Self::NotFound(_) => "E1003",
            Self::InvalidState(_) => "E1004",
            Self::Unavailable(_) => "E3001",
        }
    }

    /// HTTP status for this error.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code from our taxonomy (E1001-E3001)
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Unavailable(cause) = &self {
            error!(error = %cause, "job store unavailable");
        }

        let body = ErrorResponse {
            error: ErrorDetail { code: self.code().to_string(), message: self.to_string() },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::NotFound(message) => Self::NotFound(message),
            CoreError::InvalidInput(message) | CoreError::ConstraintViolation(message) => {
                Self::Validation(message)
            },
            CoreError::InvalidState(message) | CoreError::LeaseLost(message) => {
                Self::InvalidState(message)
            },
            CoreError::Database(message) => Self::Unavailable(message),
        }
    }
}

impl From<EnqueueError> for ApiError {
    fn from(error: EnqueueError) -> Self {
        match error {
            EnqueueError::Validation(validation) => Self::Validation(validation.to_string()),
            EnqueueError::Store(store) => store.into(),
        }
    }
}

impl From<AdminError> for ApiError {
    fn from(error: AdminError) -> Self {
        match error {
            AdminError::NotFound(_) => Self::NotFound(error.to_string()),
            AdminError::InvalidState(message) => Self::InvalidState(message),
            AdminError::Store(store) => store.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}
