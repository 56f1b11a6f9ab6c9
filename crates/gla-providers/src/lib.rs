//! Generative backend abstractions for gla.
//!
//! Every backend (hosted or local) implements [`Backend`]: it receives a
//! prompt plus the retrieved log excerpts and returns generated text, or a
//! [`BackendError`] drawn from a small closed taxonomy the orchestrator can
//! act on without knowing which backend produced it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod anthropic;
mod http;
pub mod local;
pub mod openai;
pub mod registry;
pub mod scripted;

pub use anthropic::AnthropicBackend;
pub use local::LocalBackend;
pub use openai::OpenAiBackend;
pub use registry::{BackendDescriptor, BackendRegistry, BackendSummary, RegistryError};
pub use scripted::ScriptedBackend;

/// A retrieved log excerpt sent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub id: usize,
    pub text: String,
    pub line_start: usize,
    pub line_end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: Option<f32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Instructions for the model.
    pub prompt: String,
    /// Excerpts in the order they should appear.
    pub context: Vec<ContextChunk>,
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// The full user message: instructions followed by the tagged excerpts.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.prompt.len() + self.context.iter().map(|c| c.text.len() + 48).sum::<usize>(),
        );
        out.push_str(&self.prompt);
        out.push_str("\n\n=== LOG EXCERPTS ===\n");
        for chunk in &self.context {
            out.push_str(&format!(
                "\n[chunk:{} lines {}-{}]\n",
                chunk.id, chunk.line_start, chunk.line_end
            ));
            out.push_str(&chunk.text);
            if !chunk.text.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str("\n=== END OF LOG EXCERPTS ===\n");
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Other(String),
}

impl FinishReason {
    /// Map provider stop reasons (`stop`, `end_turn`, `length`, `max_tokens`).
    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop") | Some("end_turn") | Some("stop_sequence") => Self::Stop,
            Some("length") | Some("max_tokens") => Self::Length,
            Some(other) => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

/// Failures a backend can report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {message}")]
    RateLimit {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invocation cancelled")]
    Cancelled,
}

impl BackendError {
    /// Worth retrying against the same backend.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::Timeout(_))
    }

    /// Server-requested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A generative backend.
///
/// Implementations should be Send + Sync so one instance can serve
/// concurrent runs.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Generate a response for the prompt and context.
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError>;

    /// Configured name, unique within a registry.
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Context window in tokens.
    fn context_window(&self) -> usize;

    /// Tokens reserved for the response.
    fn max_response_tokens(&self) -> usize;

    /// Whether dropping an in-flight `invoke` actually stops the work.
    fn supports_cancellation(&self) -> bool {
        true
    }
}
