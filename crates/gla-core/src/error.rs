//! Error taxonomy surfaced to callers of an analysis run.

use std::fmt;

use gla_index::EmbeddingError;
use gla_providers::BackendError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::SourceError;
use crate::state::PipelineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rate limits or timeouts that outlasted retries and failover.
    TransientBackend,
    BackendUnavailable,
    ContextOverflow,
    Auth,
    Configuration,
    SourceUnavailable,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientBackend => "transient_backend",
            Self::BackendUnavailable => "backend_unavailable",
            Self::ContextOverflow => "context_overflow",
            Self::Auth => "auth",
            Self::Configuration => "configuration",
            Self::SourceUnavailable => "source_unavailable",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Whether resubmitting the same request later may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TransientBackend | Self::BackendUnavailable | Self::SourceUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed run: what went wrong and how far the pipeline got.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind} during {state}: {message}")]
pub struct AnalysisError {
    pub kind: ErrorKind,
    pub message: String,
    pub state: PipelineState,
    pub retryable: bool,
}

impl AnalysisError {
    pub fn new(kind: ErrorKind, state: PipelineState, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            state,
            retryable: kind.is_retryable(),
        }
    }

    pub fn cancelled(state: PipelineState) -> Self {
        Self::new(ErrorKind::Cancelled, state, "analysis was cancelled")
    }

    pub fn internal(state: PipelineState, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, state, message)
    }

    pub fn from_source(state: PipelineState, error: SourceError) -> Self {
        let retryable = !matches!(error, SourceError::InvalidRequest(_) | SourceError::NotFound(_));
        let mut err = Self::new(ErrorKind::SourceUnavailable, state, error.to_string());
        err.retryable = retryable;
        err
    }

    pub fn from_embedding(state: PipelineState, error: EmbeddingError) -> Self {
        let kind = match error {
            EmbeddingError::RateLimited(_) => ErrorKind::TransientBackend,
            EmbeddingError::NetworkError(_) | EmbeddingError::ApiError(_) => ErrorKind::BackendUnavailable,
            EmbeddingError::InvalidResponse(_) => ErrorKind::Internal,
        };
        Self::new(kind, state, format!("embedding failed: {}", error))
    }

    pub fn from_backend(state: PipelineState, error: BackendError) -> Self {
        let kind = match error {
            BackendError::Auth(_) => ErrorKind::Auth,
            BackendError::RateLimit { .. } | BackendError::Timeout(_) => ErrorKind::TransientBackend,
            BackendError::ContextOverflow(_) => ErrorKind::ContextOverflow,
            BackendError::Unavailable(_) => ErrorKind::BackendUnavailable,
            BackendError::Cancelled => ErrorKind::Cancelled,
        };
        Self::new(kind, state, error.to_string())
    }
}
