//! Prompt assembly and citation extraction.

use std::collections::BTreeSet;

use gla_index::{estimate_tokens, Retrieval};
use gla_providers::{ContextChunk, GenerationParams, GenerationRequest};
use once_cell::sync::Lazy;
use regex::Regex;

static CITATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[chunk:\s*(\d+)").unwrap());

/// Build the generation request for a retrieval. Excerpts are presented in
/// log order regardless of score.
pub fn build_request(job_id: &str, filename: &str, retrieval: &Retrieval, max_response_tokens: usize) -> GenerationRequest {
    let mut context: Vec<ContextChunk> = retrieval
        .chunks()
        .map(|chunk| ContextChunk {
            id: chunk.id().0,
            text: chunk.text().to_string(),
            line_start: chunk.line_start(),
            line_end: chunk.line_end(),
        })
        .collect();
    context.sort_by_key(|c| c.id);

    GenerationRequest {
        prompt: instructions(job_id, filename, retrieval.exhaustive),
        context,
        params: GenerationParams {
            max_tokens: max_response_tokens,
            temperature: Some(0.2),
        },
    }
}

/// Tokens the prompt costs before any excerpt is added: the instruction
/// block and the excerpt header.
pub fn overhead_tokens(job_id: &str, filename: &str) -> usize {
    let empty = GenerationRequest {
        prompt: instructions(job_id, filename, false),
        context: Vec::new(),
        params: GenerationParams::default(),
    };
    estimate_tokens(&empty.render())
}

fn instructions(job_id: &str, filename: &str, exhaustive: bool) -> String {
    let coverage = if exhaustive {
        "The complete log file is included below."
    } else {
        "The log file is too large to include in full; the excerpts below were selected as the most relevant to the failure."
    };

    format!(
        "You are an expert in debugging PanDA grid jobs.\n\
         Analyze the log file '{filename}' of failed job {job_id}. {coverage}\n\
         \n\
         Provide:\n\
         1. The root cause of the failure.\n\
         2. The evidence from the log that supports it.\n\
         3. Concrete steps to fix or work around the problem.\n\
         \n\
         Each excerpt is tagged [chunk:N lines A-B]. Cite every excerpt you rely on by writing its \
         tag as [chunk:N]. Only cite excerpts shown below."
    )
}

/// Chunk ids cited in `text` that were actually sent, ascending. When the
/// text cites nothing valid, every sent chunk counts as cited.
pub fn extract_citations(text: &str, sent: &[usize]) -> Vec<usize> {
    let sent_set: BTreeSet<usize> = sent.iter().copied().collect();
    let cited: BTreeSet<usize> = CITATION_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<usize>().ok())
        .filter(|id| sent_set.contains(id))
        .collect();

    if cited.is_empty() {
        sent_set.into_iter().collect()
    } else {
        cited.into_iter().collect()
    }
}
