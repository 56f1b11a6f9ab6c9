//! Log indexing and retrieval for gla.
//!
//! This crate provides:
//! - Line-aware chunking of raw job logs into overlapping segments
//! - Embedding providers (local feature hashing, OpenAI-compatible APIs)
//! - An in-memory cosine-similarity index with incremental insertion
//! - Token-budgeted greedy retrieval
//! - A lease-counted LRU cache of per-job indexes bounded by memory

pub mod cache;
pub mod chunker;
pub mod embeddings;
pub mod index;
pub mod retriever;

// Re-exports
pub use cache::{IndexCache, IndexLease};
pub use chunker::{ChunkId, ChunkerError, LogChunk, LogChunker};
pub use embeddings::{EmbeddingError, EmbeddingProvider, HashingEmbeddings, OpenAiCompatibleEmbeddings};
pub use index::{Indexer, RetrievalIndex};
pub use retriever::{Retrieval, Retriever, ScoredChunk};

use sha2::{Digest, Sha256};

/// Approximate token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// SHA256 hash of a log's content, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
