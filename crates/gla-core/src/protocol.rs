//! Wire types shared by the HTTP server and client.
//!
//! JSON bodies use camelCase field names. Streaming responses are
//! Server-Sent Events whose event names are listed in [`event`]; every
//! event after `session` carries a sequence number as its SSE `id`, which a
//! client passes back as `after` to resume.

use gla_providers::BackendSummary;
use serde::{Deserialize, Serialize};

use crate::{AnalysisError, AnalysisRequest, AnalysisResult, StateEvent};

/// Response header carrying the session token of an analysis.
pub const REQUEST_TOKEN_HEADER: &str = "x-request-token";

pub mod event {
    pub const SESSION: &str = "session";
    pub const STATE: &str = "state";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
}

/// Body of `POST /analyze`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<String>,
}

impl AnalyzeRequest {
    pub fn to_analysis_request(&self) -> AnalysisRequest {
        AnalysisRequest {
            job_id: self.job_id.clone(),
            filename: self.filename.clone(),
            backend: self.backend.clone(),
            query: self.query.clone(),
            max_tokens: self.max_tokens,
        }
    }
}

/// Payload of the `session` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub token: String,
    /// True when the request joined a run already in flight.
    #[serde(default)]
    pub joined: bool,
}

/// Body of `GET /`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub message: String,
    pub available_backends: Vec<BackendSummary>,
    pub default_backend: String,
    pub active_runs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Failed,
}

/// Body of `GET /runs/:token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub token: String,
    pub job_id: String,
    pub filename: String,
    pub backend: String,
    pub status: RunStatus,
    /// Number of sequenced events emitted so far.
    pub events: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AnalysisError>,
}

/// A decoded streaming event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Session(SessionInfo),
    State(StateEvent),
    Result(Box<AnalysisResult>),
    Error(AnalysisError),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session(_) => event::SESSION,
            Self::State(_) => event::STATE,
            Self::Result(_) => event::RESULT,
            Self::Error(_) => event::ERROR,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error(_))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Session(info) => serde_json::to_string(info),
            Self::State(state) => serde_json::to_string(state),
            Self::Result(result) => serde_json::to_string(result),
            Self::Error(error) => serde_json::to_string(error),
        }
    }

    /// Decode an event from its SSE name and data. Unknown names yield
    /// `Ok(None)`.
    pub fn parse(name: &str, data: &str) -> serde_json::Result<Option<Self>> {
        let event = match name {
            event::SESSION => Self::Session(serde_json::from_str(data)?),
            event::STATE => Self::State(serde_json::from_str(data)?),
            event::RESULT => Self::Result(Box::new(serde_json::from_str(data)?)),
            event::ERROR => Self::Error(serde_json::from_str(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
