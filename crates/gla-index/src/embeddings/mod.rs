//! Embedding provider trait and implementations.
//!
//! The index never computes embeddings itself; it delegates to an
//! [`EmbeddingProvider`]. Two implementations are provided: a local
//! feature-hashing embedder that needs no network, and a client for any
//! OpenAI-compatible `/embeddings` endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding service rejected the request: {0}")]
    ApiError(String),

    #[error("malformed embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding service is throttling requests (retry in {0}s)")]
    RateLimited(u64),

    #[error("embedding service unreachable: {0}")]
    NetworkError(String),
}

/// Turns text into fixed-width vectors. Chunks and queries must go through
/// the same provider for their scores to be comparable.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        match vectors.pop() {
            Some(vector) if vectors.is_empty() => Ok(vector),
            _ => Err(EmbeddingError::InvalidResponse(
                "expected exactly one vector for a single text".to_string(),
            )),
        }
    }

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;

    /// Largest number of texts sent in one call.
    fn max_batch_size(&self) -> usize {
        32
    }
}

/// Deterministic bag-of-words embedder using signed feature hashing.
///
/// Tokens are lowercased alphanumeric runs; purely numeric tokens
/// (timestamps, pids, byte counts) are skipped since they dominate logs
/// without carrying meaning. Vectors are L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbeddings {
    dimensions: usize,
}

impl HashingEmbeddings {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|s| s.len() > 1 && !s.chars().all(|c| c.is_ascii_digit()))
            .map(|s| s.to_lowercase())
    }

    /// 64-bit FNV-1a; stable across processes and releases.
    fn hash(token: &str) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in Self::tokenize(text) {
            *counts.entry(token).or_insert(0) += 1;
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for (token, count) in counts {
            let hash = Self::hash(&token);
            let slot = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign * (1.0 + (count as f32).ln());
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }

    fn max_batch_size(&self) -> usize {
        256
    }
}

#[derive(Serialize)]
struct EmbedBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedReply {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    index: usize,
    embedding: Vec<f32>,
}

const DEFAULT_EMBEDDINGS_URL: &str = "https://api.openai.com/v1";
const THROTTLE_RETRIES: u32 = 3;

/// Outcome of a single POST to the embeddings endpoint.
enum Reply {
    Vectors(Vec<Vec<f32>>),
    Throttled(u64),
}

/// Client for any server exposing an OpenAI-style `/embeddings` route,
/// including llama.cpp and Ollama running next to the analyzer.
pub struct OpenAiCompatibleEmbeddings {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl OpenAiCompatibleEmbeddings {
    pub fn new(api_key: Option<String>, model: String, dimensions: usize) -> Self {
        Self {
            http: Client::new(),
            base_url: DEFAULT_EMBEDDINGS_URL.to_string(),
            api_key,
            model,
            dimensions,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    async fn post(&self, texts: &[String]) -> Result<Reply, EmbeddingError> {
        let body = EmbedBody {
            model: &self.model,
            input: texts,
        };
        let mut request = self.http.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(1);
            return Ok(Reply::Throttled(wait));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiError(format!("HTTP {}: {}", status.as_u16(), detail.trim())));
        }

        let reply: EmbedReply = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        self.place(reply.data, texts.len()).map(Reply::Vectors)
    }

    /// Order vectors by their `index` field, rejecting gaps, duplicates and
    /// vectors of the wrong width.
    fn place(&self, items: Vec<EmbedItem>, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
        for item in items {
            if item.embedding.len() != self.dimensions {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "vector {} has {} dimensions, configured for {}",
                    item.index,
                    item.embedding.len(),
                    self.dimensions
                )));
            }
            match slots.get_mut(item.index) {
                Some(slot @ None) => *slot = Some(item.embedding),
                Some(Some(_)) => {
                    return Err(EmbeddingError::InvalidResponse(format!("duplicate index {}", item.index)))
                }
                None => return Err(EmbeddingError::InvalidResponse(format!("index {} out of range", item.index))),
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.ok_or_else(|| EmbeddingError::InvalidResponse(format!("missing vector {}", i))))
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut throttled = 0;
        loop {
            debug!("Embedding {} texts via {}", texts.len(), self.endpoint());
            match self.post(texts).await? {
                Reply::Vectors(vectors) => return Ok(vectors),
                Reply::Throttled(wait) if throttled < THROTTLE_RETRIES => {
                    throttled += 1;
                    warn!("Embedding service throttled, waiting {}s ({}/{})", wait, throttled, THROTTLE_RETRIES);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                Reply::Throttled(wait) => return Err(EmbeddingError::RateLimited(wait)),
            }
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_hashing_is_deterministic_and_normalised() {
        let provider = HashingEmbeddings::new(256);
        let a = provider.embed("Stage-in failed: lost heartbeat").await.unwrap();
        let b = provider.embed("Stage-in failed: lost heartbeat").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_hashing_similarity_tracks_vocabulary() {
        let provider = HashingEmbeddings::new(512);
        let query = provider.embed("payload error exception").await.unwrap();
        let related = provider
            .embed("2025-01-01 12:00:00 ERROR payload raised exception in transform")
            .await
            .unwrap();
        let unrelated = provider
            .embed("2025-01-01 12:00:00 INFO copying input file to scratch")
            .await
            .unwrap();
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[tokio::test]
    async fn test_hashing_ignores_numbers() {
        let provider = HashingEmbeddings::new(64);
        let v = provider.embed("12345 67890 2025").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_hashing_batch_matches_single() {
        let provider = HashingEmbeddings::new(128);
        let texts = vec!["alpha beta".to_string(), "gamma delta".to_string()];
        let batch = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1], provider.embed("gamma delta").await.unwrap());
    }

    fn item(index: usize, embedding: Vec<f32>) -> EmbedItem {
        EmbedItem { index, embedding }
    }

    #[test]
    fn test_place_orders_by_index() {
        let provider = OpenAiCompatibleEmbeddings::new(None, "m".to_string(), 2);
        let placed = provider
            .place(vec![item(1, vec![1.0, 1.0]), item(0, vec![0.0, 0.0])], 2)
            .unwrap();
        assert_eq!(placed, vec![vec![0.0, 0.0], vec![1.0, 1.0]]);
    }

    #[test]
    fn test_place_rejects_bad_replies() {
        let provider = OpenAiCompatibleEmbeddings::new(None, "m".to_string(), 2);
        assert!(provider.place(vec![item(0, vec![1.0])], 1).is_err());
        assert!(provider.place(vec![item(0, vec![1.0, 0.0]), item(0, vec![1.0, 0.0])], 2).is_err());
        assert!(provider.place(vec![item(3, vec![1.0, 0.0])], 1).is_err());
        assert!(provider.place(vec![item(0, vec![1.0, 0.0])], 2).is_err());
    }

    #[test]
    fn test_provider_creation() {
        let provider =
            OpenAiCompatibleEmbeddings::new(Some("test-key".to_string()), "text-embedding-3-small".to_string(), 1536);
        assert_eq!(provider.dimensions(), 1536);
        assert_eq!(provider.model_name(), "text-embedding-3-small");
        assert_eq!(provider.max_batch_size(), 32);
        assert_eq!(provider.endpoint(), "https://api.openai.com/v1/embeddings");
    }

    #[test]
    fn test_provider_with_base_url() {
        let provider = OpenAiCompatibleEmbeddings::new(None, "nomic-embed-text".to_string(), 768)
            .with_base_url("http://localhost:11434/v1/");
        assert_eq!(provider.endpoint(), "http://localhost:11434/v1/embeddings");
    }
}
