//! OpenAI chat completions backend.
//!
//! Also speaks to any server exposing the same `/chat/completions` surface,
//! which is how [`LocalBackend`](crate::LocalBackend) reaches llama.cpp or
//! Ollama.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::http::{build_client, classify_transport, error_from_response};
use crate::{Backend, BackendError, FinishReason, GenerationRequest, GenerationResult, Usage};

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
    name: String,
    api_key: Option<String>,
    model: String,
    base_url: String,
    context_window: usize,
    max_response_tokens: usize,
}

impl OpenAiBackend {
    /// `api_key` may be `None` for servers that do not authenticate.
    pub fn new(
        name: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        base_url: Option<String>,
        context_window: usize,
        max_response_tokens: usize,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let model = model.into();
        let base_url = base_url
            .unwrap_or_else(|| OPENAI_DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        debug!(
            "Initialized OpenAI-compatible backend '{}' with model: {}, base_url: {}",
            name, model, base_url
        );

        Ok(Self {
            client: build_client(timeout)?,
            name,
            api_key,
            model,
            base_url,
            context_window,
            max_response_tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn create_request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": request.params.max_tokens,
            "messages": [
                { "role": "user", "content": request.render() }
            ],
            "stream": false,
        });
        if let Some(temperature) = request.params.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError> {
        debug!(
            "Sending request to {}: model={}, {} context chunks",
            self.base_url,
            self.model,
            request.context.len()
        );

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&self.create_request_body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_transport)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("Failed to parse chat response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Unavailable("Response contained no choices".to_string()))?;

        let usage = parsed
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        debug!("Chat completion successful: {} tokens generated", usage.completion_tokens);

        Ok(GenerationResult {
            text: choice.message.content.unwrap_or_default(),
            usage,
            finish_reason: FinishReason::from_provider(choice.finish_reason.as_deref()),
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
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
