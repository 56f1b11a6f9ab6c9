//! In-memory similarity index over log chunks.
//!
//! The [`Indexer`] coordinates the chunker and the embedding provider to turn
//! a raw log into a [`RetrievalIndex`]. The index itself is a plain data
//! structure: chunks in log order plus their vectors, searched by cosine
//! similarity.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::chunker::{ChunkId, LogChunk, LogChunker};
use crate::embeddings::{EmbeddingError, EmbeddingProvider};

/// Chunks of one log with their embeddings.
#[derive(Debug, Clone)]
pub struct RetrievalIndex {
    chunks: Vec<LogChunk>,
    norms: Vec<f32>,
    dimensions: usize,
    content_hash: String,
    /// Length in bytes of the log text covered so far.
    source_len: usize,
    /// Number of lines covered so far.
    source_lines: usize,
}

impl RetrievalIndex {
    /// An empty index for vectors of the given size.
    pub fn new(dimensions: usize, content_hash: impl Into<String>) -> Self {
        Self {
            chunks: Vec::new(),
            norms: Vec::new(),
            dimensions,
            content_hash: content_hash.into(),
            source_len: 0,
            source_lines: 0,
        }
    }

    /// Add a chunk at the end of the index without rebuilding.
    ///
    /// The chunk's embedding must have the index's dimensionality and its id
    /// must be the next in sequence.
    pub fn insert(&mut self, chunk: LogChunk) -> Result<(), EmbeddingError> {
        if chunk.embedding().len() != self.dimensions {
            return Err(EmbeddingError::InvalidResponse(format!(
                "chunk {} has {} dimensions, index expects {}",
                chunk.id(),
                chunk.embedding().len(),
                self.dimensions
            )));
        }
        if chunk.id() != ChunkId(self.chunks.len()) {
            return Err(EmbeddingError::InvalidResponse(format!(
                "chunk {} inserted out of order, expected id {}",
                chunk.id(),
                self.chunks.len()
            )));
        }

        let norm = chunk.embedding().iter().map(|v| v * v).sum::<f32>().sqrt();
        self.source_len = self.source_len.max(chunk.source_range().end);
        self.source_lines = self.source_lines.max(chunk.line_end());
        self.norms.push(norm);
        self.chunks.push(chunk);
        Ok(())
    }

    /// Top `k` chunks by cosine similarity to `query`, best first. Ties go to
    /// the earlier chunk.
    pub fn nearest_neighbors(&self, query: &[f32], k: usize) -> Vec<(ChunkId, f32)> {
        let mut scored = self.score_all(query);
        scored.truncate(k);
        scored
    }

    /// Every chunk scored against `query`, best first, ties by log order.
    pub fn score_all(&self, query: &[f32]) -> Vec<(ChunkId, f32)> {
        let query_norm = query.iter().map(|v| v * v).sum::<f32>().sqrt();

        let mut scored: Vec<(ChunkId, f32)> = self
            .chunks
            .iter()
            .zip(&self.norms)
            .map(|(chunk, norm)| {
                let score = if query.len() != self.dimensions || query_norm == 0.0 || *norm == 0.0 {
                    0.0
                } else {
                    let dot: f32 = chunk.embedding().iter().zip(query).map(|(a, b)| a * b).sum();
                    dot / (norm * query_norm)
                };
                (chunk.id(), score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored
    }

    pub fn get(&self, id: ChunkId) -> Option<&LogChunk> {
        self.chunks.get(id.0)
    }

    pub fn chunks(&self) -> &[LogChunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Hash of the log content this index was built from.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Bytes of log text covered by the indexed chunks.
    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Rough heap footprint, used for cache accounting.
    pub fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.content_hash.capacity()
            + self.norms.capacity() * std::mem::size_of::<f32>()
            + self.chunks.iter().map(|c| c.approx_bytes()).sum::<usize>()
    }
}

/// Builds retrieval indexes from raw logs.
pub struct Indexer {
    chunker: LogChunker,
    embeddings: Arc<dyn EmbeddingProvider>,
}

impl Indexer {
    pub fn new(chunker: LogChunker, embeddings: Arc<dyn EmbeddingProvider>) -> Self {
        Self { chunker, embeddings }
    }

    pub fn chunker(&self) -> &LogChunker {
        &self.chunker
    }

    pub fn embeddings(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embeddings
    }

    /// Generate embeddings for chunks, batched to the provider's limit.
    pub async fn embed(&self, chunks: &[LogChunk]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let batch_size = self.embeddings.max_batch_size().max(1);
        let mut vectors = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text().to_string()).collect();
            let embedded = self.embeddings.embed_batch(&texts).await?;
            if embedded.len() != batch.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    embedded.len()
                )));
            }
            vectors.extend(embedded);
        }

        Ok(vectors)
    }

    /// Pair chunks with their vectors into an index.
    pub fn build(
        &self,
        chunks: Vec<LogChunk>,
        vectors: Vec<Vec<f32>>,
        content_hash: impl Into<String>,
    ) -> Result<RetrievalIndex, EmbeddingError> {
        if chunks.len() != vectors.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }

        let mut index = RetrievalIndex::new(self.embeddings.dimensions(), content_hash);
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            index.insert(chunk.with_embedding(vector))?;
        }
        Ok(index)
    }

    /// Split, embed and index a whole log.
    pub async fn index_log(&self, text: &str, content_hash: &str) -> Result<RetrievalIndex, EmbeddingError> {
        let start = Instant::now();
        let chunks = self.chunker.split(text);
        debug!("Embedding {} chunks with {}", chunks.len(), self.embeddings.model_name());

        let vectors = self.embed(&chunks).await?;
        let index = self.build(chunks, vectors, content_hash)?;

        info!(
            "Indexed {} bytes into {} chunks in {}ms",
            text.len(),
            index.len(),
            start.elapsed().as_millis()
        );
        Ok(index)
    }

    /// Index text appended to a growing log without rebuilding.
    ///
    /// The appended text is chunked on its own and its chunks are inserted
    /// after the existing ones, with offsets and line numbers shifted past
    /// the already-indexed content. `new_content_hash` describes the whole
    /// log after the append. Returns the number of chunks added.
    pub async fn extend(
        &self,
        index: &mut RetrievalIndex,
        appended: &str,
        new_content_hash: &str,
    ) -> Result<usize, EmbeddingError> {
        let base_id = index.len();
        let byte_offset = index.source_len;
        let line_offset = index.source_lines;

        let chunks: Vec<LogChunk> = self
            .chunker
            .split(appended)
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| chunk.rebased(ChunkId(base_id + i), byte_offset, line_offset))
            .collect();

        let vectors = self.embed(&chunks).await?;
        let added = chunks.len();
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            index.insert(chunk.with_embedding(vector))?;
        }
        index.content_hash = new_content_hash.to_string();

        debug!("Extended index by {} chunks ({} total)", added, index.len());
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbeddings;
    use crate::content_hash;

    fn indexer(max: usize, overlap: usize) -> Indexer {
        Indexer::new(
            LogChunker::new(max, overlap).unwrap(),
            Arc::new(HashingEmbeddings::new(256)),
        )
    }

    fn manual_chunk(id: usize, vector: Vec<f32>) -> LogChunk {
        LogChunk::new(ChunkId(id), id * 10..id * 10 + 10, id + 1, id + 1, format!("chunk {}\n", id))
            .with_embedding(vector)
    }

    #[test]
    fn test_nearest_neighbors_order_and_ties() {
        let mut index = RetrievalIndex::new(2, "h");
        index.insert(manual_chunk(0, vec![0.0, 1.0])).unwrap();
        index.insert(manual_chunk(1, vec![1.0, 0.0])).unwrap();
        index.insert(manual_chunk(2, vec![2.0, 0.0])).unwrap();
        index.insert(manual_chunk(3, vec![1.0, 1.0])).unwrap();

        let hits = index.nearest_neighbors(&[1.0, 0.0], 3);
        // chunks 1 and 2 are equally similar; the earlier one wins
        assert_eq!(hits[0].0, ChunkId(1));
        assert_eq!(hits[1].0, ChunkId(2));
        assert_eq!(hits[2].0, ChunkId(3));
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_insert_rejects_wrong_dimensions_and_order() {
        let mut index = RetrievalIndex::new(3, "h");
        assert!(index.insert(manual_chunk(0, vec![1.0, 0.0])).is_err());
        assert!(index.insert(manual_chunk(1, vec![1.0, 0.0, 0.0])).is_err());
        assert!(index.insert(manual_chunk(0, vec![1.0, 0.0, 0.0])).is_ok());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_zero_query_scores_zero() {
        let mut index = RetrievalIndex::new(2, "h");
        index.insert(manual_chunk(0, vec![1.0, 0.0])).unwrap();
        let hits = index.score_all(&[0.0, 0.0]);
        assert_eq!(hits, vec![(ChunkId(0), 0.0)]);
    }

    #[tokio::test]
    async fn test_index_log_finds_relevant_chunk() {
        let mut log = String::new();
        for i in 0..200 {
            log.push_str(&format!("{} INFO transferring input file part {}\n", i, i));
        }
        log.push_str("201 ERROR payload crashed with segmentation violation\n");
        for i in 0..50 {
            log.push_str(&format!("{} INFO cleaning up workdir {}\n", 300 + i, i));
        }

        let indexer = indexer(600, 60);
        let hash = content_hash(&log);
        let index = indexer.index_log(&log, &hash).await.unwrap();
        assert_eq!(index.content_hash(), hash);
        assert!(index.len() > 5);

        let query = indexer
            .embeddings()
            .embed("segmentation violation crashed")
            .await
            .unwrap();
        let best = index.nearest_neighbors(&query, 1)[0].0;
        assert!(index.get(best).unwrap().text().contains("segmentation violation"));
    }

    #[tokio::test]
    async fn test_extend_appends_without_rebuild() {
        let indexer = indexer(200, 20);
        let head = "line a\n".repeat(60);
        let tail = "line b\n".repeat(30);

        let mut index = indexer.index_log(&head, &content_hash(&head)).await.unwrap();
        let before = index.len();
        let first_chunks: Vec<_> = index.chunks().to_vec();

        let full = format!("{}{}", head, tail);
        let added = indexer.extend(&mut index, &tail, &content_hash(&full)).await.unwrap();

        assert!(added > 0);
        assert_eq!(index.len(), before + added);
        assert_eq!(&index.chunks()[..before], first_chunks.as_slice());
        assert_eq!(index.content_hash(), content_hash(&full));

        for chunk in &index.chunks()[before..] {
            assert_eq!(&full[chunk.source_range()], chunk.text());
            assert!(chunk.line_start() > 60);
        }
        assert_eq!(index.chunks().last().unwrap().source_range().end, full.len());
    }

    #[tokio::test]
    async fn test_build_rejects_mismatched_vectors() {
        let indexer = indexer(100, 10);
        let chunks = indexer.chunker().split("one\ntwo\n");
        assert!(indexer.build(chunks, vec![], "h").is_err());
    }
}
