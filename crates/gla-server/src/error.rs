//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gla_core::{AnalysisError, ErrorKind};
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// A request the server could not accept, as opposed to an analysis that
/// ran and failed.
#[derive(Debug, Clone, Serialize, Error)]
#[error("{status}: {message}")]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(status: StatusCode, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::with_code(
            StatusCode::NOT_FOUND,
            format!("not found: {}", resource.into()),
            "NOT_FOUND",
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::with_code(StatusCode::UNPROCESSABLE_ENTITY, message, "VALIDATION_ERROR")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_code(StatusCode::GATEWAY_TIMEOUT, message, "TIMEOUT")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

/// HTTP status for a failed analysis.
pub fn status_for(error: &AnalysisError) -> StatusCode {
    match error.kind {
        ErrorKind::Configuration => StatusCode::BAD_REQUEST,
        ErrorKind::SourceUnavailable if !error.retryable => StatusCode::NOT_FOUND,
        ErrorKind::SourceUnavailable | ErrorKind::BackendUnavailable | ErrorKind::Auth => StatusCode::BAD_GATEWAY,
        ErrorKind::TransientBackend => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ContextOverflow => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Body `{kind, message, state, retryable}` with the matching status.
pub fn analysis_error_response(error: AnalysisError) -> Response {
    (status_for(&error), Json(error)).into_response()
}
