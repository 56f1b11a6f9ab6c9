//! In-process backend that replays a script of outcomes.
//!
//! Used by tests and offline demos in place of a network service. When the
//! script runs dry it answers with a canned explanation citing the first
//! chunk it was given.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::{Backend, BackendError, FinishReason, GenerationRequest, GenerationResult, Usage};

pub struct ScriptedBackend {
    name: String,
    model: String,
    context_window: usize,
    max_response_tokens: usize,
    cancellable: bool,
    delay: Option<Duration>,
    script: Mutex<VecDeque<Result<String, BackendError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    calls: AtomicUsize,
    completed: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: "scripted".to_string(),
            context_window: 8192,
            max_response_tokens: 1000,
            cancellable: true,
            delay: None,
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn with_context_window(mut self, context_window: usize, max_response_tokens: usize) -> Self {
        self.context_window = context_window;
        self.max_response_tokens = max_response_tokens;
        self
    }

    /// Sleep this long inside every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_cancellation(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Queue a successful response.
    pub fn respond(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    /// Queue a failure.
    pub fn fail(self, error: BackendError) -> Self {
        self.push(Err(error));
        self
    }

    fn push(&self, outcome: Result<String, BackendError>) {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(outcome);
    }

    /// Number of `invoke` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of invocations that ran to the end, successful or not.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn canned_answer(request: &GenerationRequest) -> String {
        match request.context.first() {
            Some(chunk) => format!(
                "Root cause: the failure is visible in the excerpt at lines {}-{} [chunk:{}].",
                chunk.line_start, chunk.line_end, chunk.id
            ),
            None => "Root cause: no log excerpts were provided.".to_string(),
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        self.completed.fetch_add(1, Ordering::SeqCst);
        let text = match next {
            Some(outcome) => outcome?,
            None => Self::canned_answer(&request),
        };

        let prompt_tokens = request.render().chars().count().div_ceil(4) as u32;
        let completion_tokens = text.chars().count().div_ceil(4) as u32;
        Ok(GenerationResult {
            text,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            finish_reason: FinishReason::Stop,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn max_response_tokens(&self) -> usize {
        self.max_response_tokens
    }

    fn supports_cancellation(&self) -> bool {
        self.cancellable
    }
}
