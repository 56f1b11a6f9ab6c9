use std::sync::Arc;
use std::time::Duration;

use gla_config::Config;
use gla_core::{
    AnalysisMethod, AnalysisRequest, ErrorKind, Orchestrator, PipelineState, StateEvent, StaticLogSource,
};
use gla_index::estimate_tokens;
use gla_providers::{Backend, BackendError, BackendRegistry, ScriptedBackend};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn pilot_log(lines: usize) -> String {
    let mut log = String::new();
    for i in 0..lines {
        log.push_str(&format!(
            "2024-03-01 10:{:02}:{:02} | INFO  | pilot | monitoring payload, cpu ok, memory ok\n",
            (i / 60) % 60,
            i % 60
        ));
    }
    log.push_str("2024-03-01 11:00:00 | ERROR | pilot | stage-out failed: no space left on device\n");
    log.push_str("2024-03-01 11:00:01 | ERROR | pilot | payload exit code 137, job killed\n");
    log
}

fn config() -> Config {
    let mut config = Config::default();
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

fn orchestrator(backends: Vec<Arc<ScriptedBackend>>, source: Arc<StaticLogSource>) -> Orchestrator {
    let backends: Vec<Arc<dyn Backend>> = backends.into_iter().map(|b| b as Arc<dyn Backend>).collect();
    let registry = Arc::new(BackendRegistry::new(backends, None).unwrap());
    Orchestrator::with_parts(&config(), registry, source).unwrap()
}

fn source_with(log: String) -> Arc<StaticLogSource> {
    Arc::new(StaticLogSource::new().with_log("6610588906", "pilotlog.txt", log))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<StateEvent>) -> Vec<StateEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn rate_limited() -> BackendError {
    BackendError::RateLimit {
        retry_after: None,
        message: "429 too many requests".to_string(),
    }
}

#[tokio::test]
async fn test_small_log_is_analyzed_in_full() {
    let backend = Arc::new(ScriptedBackend::new("llama"));
    let orch = orchestrator(vec![backend.clone()], source_with(pilot_log(10)));

    let result = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(result.analysis_method, AnalysisMethod::Full);
    assert!(!result.truncated);
    assert_eq!(result.job_id, "6610588906");
    assert_eq!(result.filename, "pilotlog.txt");
    assert!(result.explanation.starts_with("Root cause"));
    assert_eq!(result.tokens_used, result.usage.total_tokens);
    assert_eq!(result.cited_chunks.len(), 1);
}

#[tokio::test]
async fn test_large_log_uses_retrieval_within_budget() {
    let backend = Arc::new(ScriptedBackend::new("llama").with_context_window(4000, 1000));
    let orch = orchestrator(vec![backend.clone()], source_with(pilot_log(2000)));

    let result = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(result.analysis_method, AnalysisMethod::Rag);
    assert!(result.context_tokens <= 3000);

    let sent = &backend.requests()[0];
    assert!(sent.context.iter().any(|c| c.text.contains("no space left on device")));
}

#[tokio::test]
async fn test_rate_limits_exhaust_retries_then_fail_over() {
    let primary = Arc::new(
        ScriptedBackend::new("claude")
            .fail(rate_limited())
            .fail(rate_limited())
            .fail(rate_limited()),
    );
    let secondary = Arc::new(ScriptedBackend::new("llama"));
    let orch = orchestrator(vec![primary.clone(), secondary.clone()], source_with(pilot_log(10)));

    let result = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(primary.calls(), 3);
    assert_eq!(secondary.calls(), 1);
    assert_eq!(result.backend, "llama");
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let backend = Arc::new(
        ScriptedBackend::new("llama")
            .fail(BackendError::Timeout("30s".to_string()))
            .respond("Root cause: disk full [chunk:0]."),
    );
    let orch = orchestrator(vec![backend.clone()], source_with(pilot_log(10)));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), Some(tx))
        .await
        .unwrap();

    assert_eq!(backend.calls(), 2);
    assert_eq!(result.explanation, "Root cause: disk full [chunk:0].");

    let invoking: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.state == PipelineState::Invoking)
        .collect();
    assert_eq!(invoking.len(), 2);
    assert_eq!(invoking[1].detail.as_deref(), Some("attempt 2/3"));
    assert_eq!(invoking[1].backend.as_deref(), Some("llama"));
}

#[tokio::test]
async fn test_auth_failure_is_not_retried_or_failed_over() {
    let primary = Arc::new(ScriptedBackend::new("claude").fail(BackendError::Auth("invalid x-api-key".to_string())));
    let secondary = Arc::new(ScriptedBackend::new("llama"));
    let orch = orchestrator(vec![primary.clone(), secondary.clone()], source_with(pilot_log(10)));

    let err = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Auth);
    assert!(!err.retryable);
    assert_eq!(primary.calls(), 1);
    assert_eq!(secondary.calls(), 0);
}

#[tokio::test]
async fn test_unavailable_backend_fails_over_without_retry() {
    let primary = Arc::new(ScriptedBackend::new("openai").fail(BackendError::Unavailable("503".to_string())));
    let secondary = Arc::new(ScriptedBackend::new("llama"));
    let orch = orchestrator(vec![primary.clone(), secondary.clone()], source_with(pilot_log(10)));

    let result = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(primary.calls(), 1);
    assert_eq!(result.backend, "llama");
}

#[tokio::test]
async fn test_every_backend_failing_returns_last_error() {
    let primary = Arc::new(ScriptedBackend::new("openai").fail(BackendError::Unavailable("503".to_string())));
    let secondary = Arc::new(ScriptedBackend::new("llama").fail(BackendError::Unavailable("refused".to_string())));
    let orch = orchestrator(vec![primary, secondary], source_with(pilot_log(10)));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), Some(tx))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::BackendUnavailable);
    assert!(err.message.contains("refused"));
    assert!(err.retryable);

    let events = drain(&mut rx);
    assert_eq!(events.last().map(|e| e.state), Some(PipelineState::Failed));
}

#[tokio::test]
async fn test_context_overflow_narrows_budget() {
    let backend = Arc::new(
        ScriptedBackend::new("llama")
            .fail(BackendError::ContextOverflow("prompt is too long".to_string()))
            .respond("Root cause: stage-out [chunk:1]."),
    );
    let orch = orchestrator(vec![backend.clone()], source_with(pilot_log(2000)));

    orch.run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap();

    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    let context_chars = |i: usize| requests[i].context.iter().map(|c| c.text.len()).sum::<usize>();
    assert!(context_chars(1) < context_chars(0));
}

#[tokio::test]
async fn test_context_overflow_below_floor_fails() {
    // 1300 - 1000 leaves 300 prompt tokens, less the instructions; one
    // narrowing step drops below 256
    let backend = Arc::new(
        ScriptedBackend::new("llama")
            .with_context_window(1300, 1000)
            .fail(BackendError::ContextOverflow("too many tokens".to_string())),
    );
    let orch = orchestrator(vec![backend.clone()], source_with(pilot_log(200)));

    let err = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ContextOverflow);
    assert_eq!(err.state, PipelineState::Invoking);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_cancel_during_invoke() {
    let backend = Arc::new(ScriptedBackend::new("llama").with_delay(Duration::from_secs(30)));
    let orch = Arc::new(orchestrator(vec![backend.clone()], source_with(pilot_log(10))));
    let cancel = CancellationToken::new();

    let run = {
        let orch = orch.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orch.run(AnalysisRequest::new("6610588906"), cancel, None).await })
    };

    while backend.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run should stop promptly")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(err.state, PipelineState::Invoking);
}

#[tokio::test]
async fn test_growing_log_extends_cached_index() {
    let source = source_with(pilot_log(40));
    let backend = Arc::new(ScriptedBackend::new("llama"));
    let orch = orchestrator(vec![backend], source.clone());

    orch.run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap();

    let mut grown = pilot_log(40);
    grown.push_str("2024-03-01 11:05:00 | ERROR | pilot | lost heartbeat, giving up\n");
    source.insert("6610588906", "pilotlog.txt", grown.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), Some(tx))
        .await
        .unwrap();

    assert_eq!(result.file_size, grown.len());
    assert!(drain(&mut rx)
        .iter()
        .any(|e| e.detail.as_deref() == Some("extending cached index")));
    assert_eq!(orch.cache().len(), 1);

    // Same content again is a plain cache hit.
    let (tx, mut rx) = mpsc::unbounded_channel();
    orch.run(AnalysisRequest::new("6610588906"), CancellationToken::new(), Some(tx))
        .await
        .unwrap();
    assert!(drain(&mut rx)
        .iter()
        .any(|e| e.detail.as_deref() == Some("using cached index")));
}

#[tokio::test]
async fn test_max_tokens_caps_context_without_response_margin() {
    let backend = Arc::new(ScriptedBackend::new("llama"));
    let orch = orchestrator(vec![backend.clone()], source_with(pilot_log(2000)));

    let result = orch
        .run(
            AnalysisRequest::new("6610588906").with_max_tokens(1000),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(backend.calls(), 1);
    assert_eq!(result.analysis_method, AnalysisMethod::Rag);
    assert!(result.context_tokens <= 1000);
    // Close to the cap, not cut by the response margin.
    assert!(result.context_tokens > 500);
}

#[tokio::test]
async fn test_small_max_tokens_still_invokes_backend() {
    let backend = Arc::new(ScriptedBackend::new("llama"));
    let orch = orchestrator(vec![backend.clone()], source_with(pilot_log(2000)));

    let result = orch
        .run(
            AnalysisRequest::new("6610588906").with_max_tokens(300),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(backend.calls(), 1);
    assert!(result.context_tokens <= 300);
}

#[tokio::test]
async fn test_rendered_prompt_fits_backend_window() {
    let backend = Arc::new(ScriptedBackend::new("llama").with_context_window(1500, 1000));
    let orch = orchestrator(vec![backend.clone()], source_with(pilot_log(2000)));

    orch.run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap();

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert!(estimate_tokens(&requests[0].render()) <= 500);
}

#[tokio::test]
async fn test_citations_only_reference_sent_chunks() {
    let backend = Arc::new(
        ScriptedBackend::new("llama").respond("Disk full, see [chunk:1] and [chunk:9999] for the exit code."),
    );
    let orch = orchestrator(vec![backend.clone()], source_with(pilot_log(100)));

    let result = orch
        .run(AnalysisRequest::new("6610588906"), CancellationToken::new(), None)
        .await
        .unwrap();

    let sent: Vec<usize> = backend.requests()[0].context.iter().map(|c| c.id).collect();
    assert!(sent.len() > 1);
    let cited: Vec<usize> = result.cited_chunks.iter().map(|c| c.id).collect();
    assert_eq!(cited, vec![1]);
    assert!(cited.iter().all(|id| sent.contains(id)));
    assert!(!cited.contains(&9999));
}

#[tokio::test]
async fn test_cancel_detaches_non_cancellable_invoke() {
    let backend = Arc::new(
        ScriptedBackend::new("llama")
            .with_delay(Duration::from_millis(300))
            .with_cancellation(false),
    );
    let orch = Arc::new(orchestrator(vec![backend.clone()], source_with(pilot_log(10))));
    let cancel = CancellationToken::new();

    let run = {
        let orch = orch.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orch.run(AnalysisRequest::new("6610588906"), cancel, None).await })
    };

    while backend.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_millis(200), run)
        .await
        .expect("run should not wait for the detached call")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(err.state, PipelineState::Invoking);
    assert_eq!(backend.completed(), 0);

    // The detached call finishes on its own; its answer goes nowhere.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(backend.completed(), 1);
    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.requests().len(), 1);
}
