//! Line-aware log chunking.
//!
//! Logs are cut into bounded, overlapping segments that respect line
//! boundaries. Only a single line longer than the chunk size is split inside
//! the line, and then only at character boundaries. Boundaries depend on
//! nothing but the input and the two size parameters, so a log chunks the
//! same way every time and cached indexes stay valid.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::estimate_tokens;

/// Errors that can occur during log chunking.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("Invalid chunking parameters: {0}")]
    InvalidParameters(String),
}

/// Position of a chunk within its log, in log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub usize);

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A segment of a log used as the retrieval unit.
///
/// Chunks are immutable once created; the indexer attaches the embedding by
/// consuming the chunk and producing a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    id: ChunkId,
    source_range: Range<usize>,
    line_start: usize,
    line_end: usize,
    text: String,
    embedding: Vec<f32>,
    token_count: usize,
}

impl LogChunk {
    /// Build a chunk from raw parts. `source_range` is a byte range into the
    /// original log.
    pub fn new(
        id: ChunkId,
        source_range: Range<usize>,
        line_start: usize,
        line_end: usize,
        text: String,
    ) -> Self {
        let token_count = estimate_tokens(&text);
        Self {
            id,
            source_range,
            line_start,
            line_end,
            text,
            embedding: Vec::new(),
            token_count,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Byte offsets into the source log.
    pub fn source_range(&self) -> Range<usize> {
        self.source_range.clone()
    }

    /// First line covered (1-indexed).
    pub fn line_start(&self) -> usize {
        self.line_start
    }

    /// Last line covered (1-indexed).
    pub fn line_end(&self) -> usize {
        self.line_end
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Attach an embedding vector.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Renumber and move the chunk forward in the log. Used when chunks of an
    /// appended log tail join an existing index.
    pub fn rebased(mut self, id: ChunkId, byte_offset: usize, line_offset: usize) -> Self {
        self.id = id;
        self.source_range = (self.source_range.start + byte_offset)..(self.source_range.end + byte_offset);
        self.line_start += line_offset;
        self.line_end += line_offset;
        self
    }

    /// A copy cut down to at most `max_tokens`, on a character boundary.
    pub fn truncated_to(&self, max_tokens: usize) -> Self {
        let max_chars = max_tokens.saturating_mul(4);
        let cut = self
            .text
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(self.text.len());
        let text = self.text[..cut].to_string();
        let token_count = estimate_tokens(&text);
        let lines_kept = text.matches('\n').count();
        Self {
            id: self.id,
            source_range: self.source_range.start..(self.source_range.start + cut),
            line_start: self.line_start,
            line_end: (self.line_start + lines_kept).min(self.line_end),
            text,
            embedding: self.embedding.clone(),
            token_count,
        }
    }

    /// Rough heap footprint, used for cache accounting.
    pub fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.text.capacity()
            + self.embedding.capacity() * std::mem::size_of::<f32>()
    }
}

/// Smallest unit the chunker moves: a whole line, or a forced piece of an
/// overlong line.
#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    end: usize,
    chars: usize,
    line: usize,
}

/// Splits raw log text into bounded, overlapping chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogChunker {
    max_chunk_chars: usize,
    overlap_chars: usize,
}

impl LogChunker {
    /// Create a chunker. `overlap_chars` must be smaller than `max_chunk_chars`.
    pub fn new(max_chunk_chars: usize, overlap_chars: usize) -> Result<Self, ChunkerError> {
        if max_chunk_chars == 0 {
            return Err(ChunkerError::InvalidParameters(
                "max_chunk_chars must be positive".to_string(),
            ));
        }
        if overlap_chars >= max_chunk_chars {
            return Err(ChunkerError::InvalidParameters(format!(
                "overlap_chars ({}) must be smaller than max_chunk_chars ({})",
                overlap_chars, max_chunk_chars
            )));
        }
        Ok(Self {
            max_chunk_chars,
            overlap_chars,
        })
    }

    pub fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Split a log into ordered chunks.
    ///
    /// Consecutive chunks share a tail of at most `overlap_chars` characters,
    /// starting on a line (or forced piece) boundary. Together the chunks
    /// cover the whole input.
    pub fn split(&self, raw_log: &str) -> Vec<LogChunk> {
        let pieces = self.pieces(raw_log);
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < pieces.len() {
            let mut end = start;
            let mut chars = 0;
            while end < pieces.len() && chars + pieces[end].chars <= self.max_chunk_chars {
                chars += pieces[end].chars;
                end += 1;
            }

            let first = pieces[start];
            let last = pieces[end - 1];
            chunks.push(LogChunk::new(
                ChunkId(chunks.len()),
                first.start..last.end,
                first.line,
                last.line,
                raw_log[first.start..last.end].to_string(),
            ));

            if end == pieces.len() {
                break;
            }

            // Walk back over whole pieces while the shared tail still fits.
            let mut next = end;
            let mut tail = 0;
            while next > start + 1 && tail + pieces[next - 1].chars <= self.overlap_chars {
                tail += pieces[next - 1].chars;
                next -= 1;
            }
            start = next;
        }

        debug!(
            "Split {} bytes into {} chunks (max {} chars, overlap {})",
            raw_log.len(),
            chunks.len(),
            self.max_chunk_chars,
            self.overlap_chars
        );
        chunks
    }

    fn pieces(&self, text: &str) -> Vec<Piece> {
        let mut pieces = Vec::new();
        let mut offset = 0;

        for (index, line) in text.split_inclusive('\n').enumerate() {
            let line_no = index + 1;
            let chars = line.chars().count();

            if chars <= self.max_chunk_chars {
                pieces.push(Piece {
                    start: offset,
                    end: offset + line.len(),
                    chars,
                    line: line_no,
                });
            } else {
                let mut piece_start = 0;
                let mut count = 0;
                for (idx, _) in line.char_indices() {
                    if count == self.max_chunk_chars {
                        pieces.push(Piece {
                            start: offset + piece_start,
                            end: offset + idx,
                            chars: count,
                            line: line_no,
                        });
                        piece_start = idx;
                        count = 0;
                    }
                    count += 1;
                }
                pieces.push(Piece {
                    start: offset + piece_start,
                    end: offset + line.len(),
                    chars: count,
                    line: line_no,
                });
            }

            offset += line.len();
        }

        pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_log(lines: usize, width: usize) -> String {
        let mut log = String::new();
        for i in 0..lines {
            let prefix = format!("{:06} ", i);
            log.push_str(&prefix);
            log.push_str(&"x".repeat(width - prefix.len() - 1));
            log.push('\n');
        }
        log
    }

    fn assert_covers(log: &str, chunks: &[LogChunk], overlap: usize) {
        assert_eq!(chunks.first().unwrap().source_range().start, 0);
        assert_eq!(chunks.last().unwrap().source_range().end, log.len());
        for pair in chunks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            // no gap
            assert!(b.source_range().start <= a.source_range().end);
            // progress
            assert!(b.source_range().start > a.source_range().start);
            let shared = &log[b.source_range().start..a.source_range().end];
            assert!(shared.chars().count() <= overlap);
        }
        for chunk in chunks {
            assert_eq!(&log[chunk.source_range()], chunk.text());
        }
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(LogChunker::new(0, 0).is_err());
        assert!(LogChunker::new(100, 100).is_err());
        assert!(LogChunker::new(100, 150).is_err());
        assert!(LogChunker::new(100, 99).is_ok());
    }

    #[test]
    fn test_empty_log() {
        let chunker = LogChunker::new(2000, 200).unwrap();
        assert!(chunker.split("").is_empty());
    }

    #[test]
    fn test_small_log_single_chunk() {
        let chunker = LogChunker::new(2000, 200).unwrap();
        let log = "line one\nline two\nline three";
        let chunks = chunker.split(log);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text(), log);
        assert_eq!(chunks[0].line_start(), 1);
        assert_eq!(chunks[0].line_end(), 3);
        assert_eq!(chunks[0].id(), ChunkId(0));
    }

    #[test]
    fn test_fifty_thousand_char_scenario() {
        let log = numbered_log(500, 100);
        assert_eq!(log.len(), 50_000);

        let chunker = LogChunker::new(2000, 200).unwrap();
        let chunks = chunker.split(&log);

        let expected = ((50_000f64 - 200.0) / 1800.0).ceil() as i64;
        let actual = chunks.len() as i64;
        assert!(
            (actual - expected).abs() <= 1,
            "expected {} +/- 1 chunks, got {}",
            expected,
            actual
        );

        assert_covers(&log, &chunks, 200);
        for chunk in &chunks {
            assert!(chunk.text().chars().count() <= 2000);
            // every chunk starts at a line start and ends at a line end
            assert!(chunk.source_range().start == 0 || log.as_bytes()[chunk.source_range().start - 1] == b'\n');
            assert!(chunk.text().ends_with('\n'));
        }
    }

    #[test]
    fn test_uneven_lines_cover_without_gaps() {
        let mut log = String::new();
        for i in 0..400 {
            log.push_str(&format!("[{}] {}\n", i, "event ".repeat(i % 17)));
        }
        let chunker = LogChunker::new(500, 120).unwrap();
        let chunks = chunker.split(&log);
        assert!(chunks.len() > 1);
        assert_covers(&log, &chunks, 120);
    }

    #[test]
    fn test_deterministic_boundaries() {
        let log = numbered_log(321, 73);
        let chunker = LogChunker::new(1000, 150).unwrap();
        let first: Vec<_> = chunker.split(&log).iter().map(|c| c.source_range()).collect();
        let second: Vec<_> = chunker.split(&log).iter().map(|c| c.source_range()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_overlong_line_force_split() {
        let long_line = "a".repeat(2500);
        let log = format!("start\n{}\nend\n", long_line);
        let chunker = LogChunker::new(1000, 100).unwrap();
        let chunks = chunker.split(&log);

        assert_covers(&log, &chunks, 100);
        for chunk in &chunks {
            assert!(chunk.text().chars().count() <= 1000);
        }
        // the long line occupies several chunks that all report line 2
        let on_line_two = chunks
            .iter()
            .filter(|c| c.line_start() == 2 && c.line_end() == 2)
            .count();
        assert!(on_line_two >= 2);
    }

    #[test]
    fn test_force_split_respects_char_boundaries() {
        let log = "é".repeat(25);
        let chunker = LogChunker::new(10, 0).unwrap();
        let chunks = chunker.split(&log);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text().chars().count(), 10);
        assert_eq!(chunks[2].text().chars().count(), 5);
        assert_covers(&log, &chunks, 0);
    }

    #[test]
    fn test_zero_overlap_partitions_exactly() {
        let log = numbered_log(50, 40);
        let chunker = LogChunker::new(400, 0).unwrap();
        let chunks = chunker.split(&log);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].source_range().end, pair[1].source_range().start);
        }
        let rebuilt: String = chunks.iter().map(|c| c.text()).collect();
        assert_eq!(rebuilt, log);
    }

    #[test]
    fn test_token_count_and_truncation() {
        let chunk = LogChunk::new(ChunkId(3), 10..410, 5, 9, "y".repeat(400));
        assert_eq!(chunk.token_count(), 100);

        let cut = chunk.truncated_to(25);
        assert_eq!(cut.token_count(), 25);
        assert_eq!(cut.text().len(), 100);
        assert_eq!(cut.source_range(), 10..110);
        assert_eq!(cut.id(), ChunkId(3));
    }

    #[test]
    fn test_rebased_chunk() {
        let chunk = LogChunk::new(ChunkId(0), 0..5, 1, 1, "tail\n".to_string());
        let moved = chunk.rebased(ChunkId(7), 100, 20);
        assert_eq!(moved.id(), ChunkId(7));
        assert_eq!(moved.source_range(), 100..105);
        assert_eq!(moved.line_start(), 21);
    }
}
