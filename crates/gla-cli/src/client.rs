//! HTTP client for a running gla server.
//!
//! Streaming analyses are consumed as Server-Sent Events. When the stream
//! drops before a terminal event the client reconnects to
//! `/runs/:token/events?after=<last seen>` instead of resubmitting, so the
//! run is never started twice.

use std::time::Duration;

use futures_util::StreamExt;
use gla_core::protocol::{AnalyzeRequest, RunInfo, StatusResponse, StreamEvent, REQUEST_TOKEN_HEADER};
use gla_core::{AnalysisError, AnalysisResult};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Transport(String),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid response: {0}")]
    Protocol(String),

    #[error("analysis failed: {0}")]
    Analysis(AnalysisError),
}

impl ClientError {
    /// Process exit code: 1 when the server answered with a failure, 2 when
    /// it could not be reached or spoke nonsense.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Analysis(_) | Self::Server { .. } => 1,
            Self::Transport(_) | Self::Protocol(_) => 2,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// One dispatched SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every frame completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() && self.event.is_none() {
                return None;
            }
            return Some(SseFrame {
                event: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: std::mem::take(&mut self.data).join("\n"),
                id: self.id.take(),
            });
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Where a streaming consumer got to.
#[derive(Debug, Clone, Default)]
struct StreamProgress {
    token: Option<String>,
    last_seq: usize,
}

pub struct AnalysisClient {
    base_url: String,
    http: Client,
    max_reconnects: usize,
    reconnect_delay: Duration,
}

impl AnalysisClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder().connect_timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            max_reconnects: 3,
            reconnect_delay: Duration::from_millis(500),
        })
    }

    pub fn with_max_reconnects(mut self, max_reconnects: usize) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        let response = self.http.get(self.url("/")).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    /// Run an analysis and wait for its outcome.
    pub async fn analyze(&self, request: &AnalyzeRequest) -> Result<AnalysisResult, ClientError> {
        let body = AnalyzeRequest {
            stream: false,
            ..request.clone()
        };
        debug!("POST /analyze for job {}", body.job_id);
        let response = self.http.post(self.url("/analyze")).json(&body).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    /// Run an analysis as a stream, calling `on_event` for every event in
    /// order. Reconnects on dropped streams.
    pub async fn analyze_streaming<F>(&self, request: &AnalyzeRequest, mut on_event: F) -> Result<AnalysisResult, ClientError>
    where
        F: FnMut(&StreamEvent),
    {
        let body = AnalyzeRequest {
            stream: true,
            ..request.clone()
        };
        let response = self.http.post(self.url("/analyze")).json(&body).send().await?;
        let response = ensure_success(response).await?;

        let mut progress = StreamProgress {
            token: header_token(&response),
            last_seq: 0,
        };
        if let Some(outcome) = consume(response, &mut progress, &mut on_event).await? {
            return Ok(outcome);
        }
        self.reconnect(progress, &mut on_event).await
    }

    /// Follow an existing run from sequence number `after`.
    pub async fn resume<F>(&self, token: &str, after: usize, mut on_event: F) -> Result<AnalysisResult, ClientError>
    where
        F: FnMut(&StreamEvent),
    {
        let mut progress = StreamProgress {
            token: Some(token.to_string()),
            last_seq: after,
        };
        let response = self.open_events(token, after).await?;
        if let Some(outcome) = consume(response, &mut progress, &mut on_event).await? {
            return Ok(outcome);
        }
        self.reconnect(progress, &mut on_event).await
    }

    async fn reconnect<F>(&self, mut progress: StreamProgress, on_event: &mut F) -> Result<AnalysisResult, ClientError>
    where
        F: FnMut(&StreamEvent),
    {
        let token = progress
            .token
            .clone()
            .ok_or_else(|| ClientError::Protocol("stream ended before a session token was received".to_string()))?;

        for attempt in 1..=self.max_reconnects {
            warn!(
                "Stream for run {} dropped after event {}, reconnecting ({}/{})",
                token, progress.last_seq, attempt, self.max_reconnects
            );
            tokio::time::sleep(self.reconnect_delay).await;

            let response = match self.open_events(&token, progress.last_seq).await {
                Ok(response) => response,
                Err(ClientError::Transport(e)) => {
                    debug!("Reconnect failed: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(outcome) = consume(response, &mut progress, on_event).await? {
                return Ok(outcome);
            }
        }

        Err(ClientError::Transport(format!(
            "stream for run {} dropped {} times without a result",
            token,
            self.max_reconnects + 1
        )))
    }

    async fn open_events(&self, token: &str, after: usize) -> Result<Response, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/runs/{}/events", token)))
            .query(&[("after", after)])
            .send()
            .await?;
        ensure_success(response).await
    }

    pub async fn run_info(&self, token: &str) -> Result<RunInfo, ClientError> {
        let response = self.http.get(self.url(&format!("/runs/{}", token))).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    pub async fn cancel(&self, token: &str) -> Result<(), ClientError> {
        let response = self.http.delete(self.url(&format!("/runs/{}", token))).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

fn header_token(response: &Response) -> Option<String> {
    response
        .headers()
        .get(REQUEST_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Pass 2xx through; turn anything else into an analysis or server error.
async fn ensure_success(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    if let Ok(error) = serde_json::from_str::<AnalysisError>(&text) {
        return Err(ClientError::Analysis(error));
    }
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or(text);
    Err(ClientError::Server {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.canonical_reason().unwrap_or("error").to_string()
        } else {
            message
        },
    })
}

/// Read events until a terminal one (`Some`) or the connection ends
/// (`None`).
async fn consume<F>(
    response: Response,
    progress: &mut StreamProgress,
    on_event: &mut F,
) -> Result<Option<AnalysisResult>, ClientError>
where
    F: FnMut(&StreamEvent),
{
    if response.status() != StatusCode::OK {
        return Err(ClientError::Protocol(format!("unexpected status {}", response.status())));
    }

    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Stream read failed: {}", e);
                return Ok(None);
            }
        };

        for frame in parser.feed(&chunk) {
            let event = StreamEvent::parse(&frame.event, &frame.data)
                .map_err(|e| ClientError::Protocol(format!("bad {} event: {}", frame.event, e)))?;
            let Some(event) = event else {
                continue;
            };

            if let Some(seq) = frame.id.as_deref().and_then(|id| id.parse::<usize>().ok()) {
                if seq <= progress.last_seq {
                    continue;
                }
                progress.last_seq = seq;
            }

            on_event(&event);
            match event {
                StreamEvent::Session(info) => progress.token = Some(info.token),
                StreamEvent::State(_) => {}
                StreamEvent::Result(result) => return Ok(Some(*result)),
                StreamEvent::Error(error) => return Err(ClientError::Analysis(error)),
            }
        }
    }
    Ok(None)
}
