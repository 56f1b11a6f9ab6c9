//! Local model server backend (llama.cpp `llama-server`, Ollama).
//!
//! Both expose an OpenAI-compatible `/v1/chat/completions` endpoint on
//! localhost and need no credential. Generation on these servers keeps
//! running after the client disconnects, so cancellation is not claimed.

use std::time::Duration;

use async_trait::async_trait;

use crate::openai::OpenAiBackend;
use crate::{Backend, BackendError, GenerationRequest, GenerationResult};

const LOCAL_DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/v1";

#[derive(Clone)]
pub struct LocalBackend {
    inner: OpenAiBackend,
}

impl LocalBackend {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        base_url: Option<String>,
        context_window: usize,
        max_response_tokens: usize,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.unwrap_or_else(|| LOCAL_DEFAULT_BASE_URL.to_string());
        Ok(Self {
            inner: OpenAiBackend::new(
                name,
                None,
                model,
                Some(base_url),
                context_window,
                max_response_tokens,
                timeout,
            )?,
        })
    }

    pub fn base_url(&self) -> &str {
        self.inner.base_url()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError> {
        self.inner.invoke(request).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn context_window(&self) -> usize {
        self.inner.context_window()
    }

    fn max_response_tokens(&self) -> usize {
        self.inner.max_response_tokens()
    }

    fn supports_cancellation(&self) -> bool {
        false
    }
}
