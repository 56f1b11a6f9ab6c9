//! Analysis orchestration engine for gla.
//!
//! An analysis run fetches a job's log, chunks and indexes it (or reuses a
//! cached index), retrieves the excerpts most relevant to the failure within
//! the chosen backend's token budget, invokes the backend and maps its
//! citations back to log offsets. [`Orchestrator`] drives the run as a
//! state machine and reports each transition as a [`StateEvent`].

pub mod error;
pub mod orchestrator;
pub mod prompt;
pub mod protocol;
pub mod source;
pub mod state;

pub use error::{AnalysisError, ErrorKind};
pub use orchestrator::{EventSink, Orchestrator, OrchestratorSettings};
pub use source::{DirectoryLogSource, HttpLogSource, LogSource, SourceError, StaticLogSource};
pub use state::{PipelineState, StateEvent};

use gla_index::LogChunk;
use gla_providers::{FinishReason, Usage};
use serde::{Deserialize, Serialize};

/// Log file analyzed when a request names none.
pub const DEFAULT_FILENAME: &str = "pilotlog.txt";

/// One analysis to perform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub job_id: String,
    pub filename: Option<String>,
    /// Preferred backend; the registry default when absent.
    pub backend: Option<String>,
    /// Retrieval hints; the configured failure query when empty.
    pub query: Vec<String>,
    /// Caps the context budget below the backend's window.
    pub max_tokens: Option<usize>,
}

impl AnalysisRequest {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_query(mut self, hint: impl Into<String>) -> Self {
        self.query.push(hint.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Whether the whole log fit in the context or excerpts were selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMethod {
    Full,
    Rag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A chunk the explanation relies on, located in the source log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitedChunk {
    pub id: usize,
    /// Byte offsets into the log.
    pub source_range: Span,
    /// 1-based inclusive line numbers.
    pub lines: Span,
}

impl From<&LogChunk> for CitedChunk {
    fn from(chunk: &LogChunk) -> Self {
        let range = chunk.source_range();
        Self {
            id: chunk.id().0,
            source_range: Span {
                start: range.start,
                end: range.end,
            },
            lines: Span {
                start: chunk.line_start(),
                end: chunk.line_end(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub job_id: String,
    pub filename: String,
    pub backend: String,
    pub model: String,
    pub explanation: String,
    pub cited_chunks: Vec<CitedChunk>,
    pub tokens_used: u32,
    pub usage: Usage,
    pub latency_ms: u64,
    pub analysis_method: AnalysisMethod,
    /// Tokens of log context sent to the backend.
    pub context_tokens: usize,
    /// The single selected chunk was cut to fit the budget.
    pub truncated: bool,
    /// Size of the analyzed log in bytes.
    pub file_size: usize,
    pub finish_reason: FinishReason,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gla_index::ChunkId;

    #[test]
    fn test_request_builder() {
        let request = AnalysisRequest::new("6610588906")
            .with_backend("claude")
            .with_query("stage-out")
            .with_max_tokens(4000);
        assert_eq!(request.job_id, "6610588906");
        assert_eq!(request.filename, None);
        assert_eq!(request.backend.as_deref(), Some("claude"));
        assert_eq!(request.query, vec!["stage-out"]);
        assert_eq!(request.max_tokens, Some(4000));
    }

    #[test]
    fn test_cited_chunk_from_log_chunk() {
        let chunk = LogChunk::new(ChunkId(3), 120..180, 7, 9, "x".repeat(60));
        let cited = CitedChunk::from(&chunk);
        assert_eq!(cited.id, 3);
        assert_eq!(cited.source_range, Span { start: 120, end: 180 });
        assert_eq!(cited.lines, Span { start: 7, end: 9 });

        let json = serde_json::to_value(&cited).unwrap();
        assert_eq!(json["sourceRange"]["start"], 120);
        assert_eq!(json["lines"]["end"], 9);
    }

    #[test]
    fn test_analysis_method_wire_names() {
        assert_eq!(serde_json::to_value(AnalysisMethod::Full).unwrap(), "full");
        assert_eq!(serde_json::to_value(AnalysisMethod::Rag).unwrap(), "rag");
    }
}
