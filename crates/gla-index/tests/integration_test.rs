//! Integration tests for gla-index crate.
//!
//! These tests run a realistic pilot log through chunking, indexing, caching
//! and retrieval.

use std::sync::Arc;

use gla_index::{
    content_hash, estimate_tokens, EmbeddingProvider, HashingEmbeddings, IndexCache, Indexer, LogChunker, Retriever,
};

fn pilot_log(lines: usize) -> String {
    let mut log = String::new();
    for i in 0..lines {
        match i {
            400 => log.push_str(
                "2025-03-01 10:14:02,118 | ERROR | payload | Payload execution failed: exit code 137 (killed, out of memory)\n",
            ),
            401 => log.push_str(
                "2025-03-01 10:14:02,119 | ERROR | payload | Traceback: MemoryError in athena transform step\n",
            ),
            _ => log.push_str(&format!(
                "2025-03-01 10:{:02}:{:02},000 | INFO | monitor | heartbeat sent, job still running, cpu {}%\n",
                (i / 60) % 60,
                i % 60,
                i % 100
            )),
        }
    }
    log
}

/// Chunks tile the log: each starts inside or right after the previous one.
#[test]
fn test_chunks_cover_log() {
    let log = pilot_log(1200);
    let chunker = LogChunker::new(2000, 200).unwrap();
    let chunks = chunker.split(&log);

    assert_eq!(chunks.first().unwrap().source_range().start, 0);
    assert_eq!(chunks.last().unwrap().source_range().end, log.len());
    for pair in chunks.windows(2) {
        let prev = pair[0].source_range();
        let next = pair[1].source_range();
        assert!(next.start <= prev.end);
        assert!(next.start > prev.start);
        let overlap = &log[next.start..prev.end];
        assert!(overlap.chars().count() <= 200);
        // chunks begin on line starts
        assert!(next.start == 0 || log.as_bytes()[next.start - 1] == b'\n');
    }
    for chunk in &chunks {
        assert_eq!(&log[chunk.source_range()], chunk.text());
        assert_eq!(chunk.token_count(), estimate_tokens(chunk.text()));
    }
}

#[tokio::test]
async fn test_failure_lines_rank_first() {
    let log = pilot_log(1200);
    let embeddings = Arc::new(HashingEmbeddings::new(512));
    let indexer = Indexer::new(LogChunker::new(2000, 200).unwrap(), embeddings.clone());
    let index = indexer.index_log(&log, &content_hash(&log)).await.unwrap();

    let query = embeddings
        .embed("error failed traceback memory killed payload")
        .await
        .unwrap();
    let retrieval = Retriever::new().retrieve(&index, &query, 1500);

    assert!(!retrieval.is_empty());
    assert!(retrieval.total_tokens <= 1500);
    assert!(!retrieval.exhaustive);
    assert!(retrieval.items[0].chunk.text().contains("| ERROR |"));

    let scores: Vec<f32> = retrieval.items.iter().map(|i| i.score).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn test_cache_extends_growing_log() {
    let embeddings = Arc::new(HashingEmbeddings::new(256));
    let indexer = Arc::new(Indexer::new(LogChunker::new(1000, 100).unwrap(), embeddings));
    let cache = IndexCache::new(64 * 1024 * 1024);
    let key = IndexCache::key_for("6610588906", "pilotlog.txt");

    let head = pilot_log(100);
    let head_hash = content_hash(&head);
    let (lease, built) = cache
        .get_or_build(&key, &head_hash, |_| {
            let indexer = indexer.clone();
            let head = head.clone();
            let hash = head_hash.clone();
            async move { indexer.index_log(&head, &hash).await }
        })
        .await
        .unwrap();
    assert!(built);
    let head_chunks = lease.len();
    drop(lease);

    let full = pilot_log(150);
    let full_hash = content_hash(&full);
    let (lease, built) = cache
        .get_or_build(&key, &full_hash, |stale| {
            let indexer = indexer.clone();
            let full = full.clone();
            let hash = full_hash.clone();
            async move {
                let mut index = match stale {
                    Some(stale) => (*stale).clone(),
                    None => return indexer.index_log(&full, &hash).await,
                };
                let start = index.source_len();
                indexer.extend(&mut index, &full[start..], &hash).await?;
                Ok(index)
            }
        })
        .await
        .unwrap();

    assert!(built);
    assert!(lease.len() > head_chunks);
    assert_eq!(lease.content_hash(), full_hash);
    assert_eq!(lease.source_len(), full.len());
    assert_eq!(cache.len(), 1);

    let (_again, built) = cache
        .get_or_build(&key, &full_hash, |_| async { Err::<gla_index::RetrievalIndex, _>("rebuilt a fresh index") })
        .await
        .unwrap();
    assert!(!built);
}
