//! Token-budgeted retrieval.

use serde::Serialize;
use tracing::debug;

use crate::chunker::LogChunk;
use crate::index::RetrievalIndex;

/// A chunk selected for the prompt, with its similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: LogChunk,
    pub score: f32,
}

/// Outcome of one retrieval pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Retrieval {
    /// Selected chunks, best first.
    pub items: Vec<ScoredChunk>,
    /// True when the top chunk alone exceeded the budget and was cut down.
    pub truncated: bool,
    pub total_tokens: usize,
    /// True when every chunk of the index made it into the selection.
    pub exhaustive: bool,
}

impl Retrieval {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &LogChunk> {
        self.items.iter().map(|item| &item.chunk)
    }
}

/// Greedy selector: take chunks in score order while they fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Retriever;

impl Retriever {
    pub fn new() -> Self {
        Self
    }

    /// Pick chunks for `query` whose token counts sum to at most
    /// `token_budget`.
    ///
    /// Selection stops at the first chunk that would overflow the budget,
    /// so lower-ranked small chunks never jump ahead of a higher-ranked one.
    /// When even the best chunk is too large it is truncated to the budget.
    pub fn retrieve(&self, index: &RetrievalIndex, query: &[f32], token_budget: usize) -> Retrieval {
        if token_budget == 0 || index.is_empty() {
            return Retrieval::default();
        }

        let mut retrieval = Retrieval::default();

        for (id, score) in index.score_all(query) {
            let Some(chunk) = index.get(id) else {
                continue;
            };

            let remaining = token_budget - retrieval.total_tokens;
            if chunk.token_count() <= remaining {
                retrieval.total_tokens += chunk.token_count();
                retrieval.items.push(ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                });
                continue;
            }

            if retrieval.items.is_empty() {
                let cut = chunk.truncated_to(token_budget);
                retrieval.total_tokens = cut.token_count();
                retrieval.truncated = true;
                retrieval.items.push(ScoredChunk { chunk: cut, score });
            }
            break;
        }

        retrieval.exhaustive = !retrieval.truncated && retrieval.items.len() == index.len();

        debug!(
            "Retrieved {}/{} chunks ({} tokens of {} budget{})",
            retrieval.items.len(),
            index.len(),
            retrieval.total_tokens,
            token_budget,
            if retrieval.truncated { ", truncated" } else { "" }
        );
        retrieval
    }
}
