//! Pipeline states and the events emitted on each transition.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage of an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Fetching,
    Chunking,
    Indexing,
    Retrieving,
    Prompting,
    Invoking,
    PostProcessing,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Chunking => "chunking",
            Self::Indexing => "indexing",
            Self::Retrieving => "retrieving",
            Self::Prompting => "prompting",
            Self::Invoking => "invoking",
            Self::PostProcessing => "post_processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent {
    #[serde(rename = "stateName")]
    pub state: PipelineState,
    pub timestamp: DateTime<Utc>,
    /// Backend being used, once one is chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Short human-readable note (attempt number, budget, cache hit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StateEvent {
    pub fn new(state: PipelineState) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
            backend: None,
            detail: None,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
