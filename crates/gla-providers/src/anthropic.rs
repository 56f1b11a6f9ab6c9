//! Anthropic Messages API backend.
//!
//! Sends the rendered prompt as a single user message to
//! `POST {base_url}/messages`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::http::{build_client, classify_transport, error_from_response};
use crate::{Backend, BackendError, FinishReason, GenerationRequest, GenerationResult, Usage};

const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicBackend {
    client: Client,
    name: String,
    api_key: String,
    model: String,
    base_url: String,
    context_window: usize,
    max_response_tokens: usize,
}

impl AnthropicBackend {
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: Option<String>,
        context_window: usize,
        max_response_tokens: usize,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let model = model.into();
        let base_url = base_url
            .unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        debug!(
            "Initialized Anthropic backend '{}' with model: {}, base_url: {}",
            name, model, base_url
        );

        Ok(Self {
            client: build_client(timeout)?,
            name,
            api_key: api_key.into(),
            model,
            base_url,
            context_window,
            max_response_tokens,
        })
    }

    fn create_request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": request.params.max_tokens,
            "messages": [
                { "role": "user", "content": request.render() }
            ],
        });
        if let Some(temperature) = request.params.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError> {
        debug!(
            "Sending request to Anthropic API: model={}, {} context chunks",
            self.model,
            request.context.len()
        );

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.create_request_body(&request))
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("Failed to parse Anthropic response: {}", e)))?;

        let text = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let usage = Usage {
            prompt_tokens: parsed.usage.input_tokens,
            completion_tokens: parsed.usage.output_tokens,
            total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
        };

        debug!("Anthropic completion successful: {} tokens generated", usage.completion_tokens);

        Ok(GenerationResult {
            text,
            usage,
            finish_reason: FinishReason::from_provider(parsed.stop_reason.as_deref()),
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
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
