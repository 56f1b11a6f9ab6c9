//! The analysis state machine.
//!
//! `Fetching -> Chunking -> Indexing -> Retrieving -> Prompting -> Invoking
//! -> PostProcessing -> Done`, with `Failed` reachable from every
//! non-terminal state. Invoking retries transient failures with backoff,
//! fails over to the next backend, and narrows the context budget when the
//! backend reports an overflow.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gla_config::{Config, EmbeddingProviderKind, EmbeddingsConfig, RetryConfig};
use gla_index::{
    content_hash, estimate_tokens, EmbeddingError, EmbeddingProvider, HashingEmbeddings, IndexCache, IndexLease, Indexer, LogChunker,
    OpenAiCompatibleEmbeddings, Retrieval, RetrievalIndex, Retriever,
};
use gla_providers::{Backend, BackendError, BackendRegistry, GenerationRequest, GenerationResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{AnalysisError, ErrorKind};
use crate::prompt;
use crate::source::{self, LogSource};
use crate::state::{PipelineState, StateEvent};
use crate::{AnalysisMethod, AnalysisRequest, AnalysisResult, CitedChunk, DEFAULT_FILENAME};

/// Receives every state transition of a run.
pub type EventSink = mpsc::UnboundedSender<StateEvent>;

/// Tunables of the orchestrator, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_filename: String,
    pub default_query: String,
    pub min_budget_tokens: usize,
    pub narrowing_factor: f64,
    pub retry: RetryConfig,
    pub invoke_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_filename: if config.source.default_filename.is_empty() {
                DEFAULT_FILENAME.to_string()
            } else {
                config.source.default_filename.clone()
            },
            default_query: config.retrieval.default_query.clone(),
            min_budget_tokens: config.retrieval.min_budget_tokens,
            narrowing_factor: config.retrieval.narrowing_factor,
            retry: config.retry.clone(),
            invoke_timeout: Duration::from_secs(config.invoke_timeout_secs),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Build the configured embedding provider.
pub fn embeddings_from_config(config: &EmbeddingsConfig) -> Arc<dyn EmbeddingProvider> {
    match config.provider {
        EmbeddingProviderKind::Hashing => Arc::new(HashingEmbeddings::new(config.dimensions)),
        EmbeddingProviderKind::Openai => {
            let mut provider =
                OpenAiCompatibleEmbeddings::new(config.api_key.clone(), config.model.clone(), config.dimensions);
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url);
            }
            Arc::new(provider)
        }
    }
}

/// Tracks the current state of one run and publishes transitions.
struct RunTracker {
    sink: Option<EventSink>,
    state: PipelineState,
    backend: Option<String>,
}

impl RunTracker {
    fn new(sink: Option<EventSink>) -> Self {
        Self {
            sink,
            state: PipelineState::Fetching,
            backend: None,
        }
    }

    fn enter(&mut self, state: PipelineState, detail: Option<String>) {
        self.state = state;
        let mut event = StateEvent::new(state);
        if let Some(backend) = &self.backend {
            event = event.with_backend(backend.clone());
        }
        if let Some(detail) = detail {
            debug!("{}: {}", state, detail);
            event = event.with_detail(detail);
        } else {
            debug!("{}", state);
        }
        publish(&self.sink, event);
    }

    fn fail(&mut self, err: AnalysisError) -> AnalysisError {
        error!("Analysis failed: {}", err);
        self.enter(PipelineState::Failed, Some(err.to_string()));
        err
    }
}

fn publish(sink: &Option<EventSink>, event: StateEvent) {
    if let Some(sink) = sink {
        // receiver gone means nobody is listening any more
        let _ = sink.send(event);
    }
}

enum BackendOutcome {
    Done(Box<AnalysisResult>),
    /// Give up on this backend and try the next one.
    Failover(AnalysisError),
    /// Stop the run.
    Fatal(AnalysisError),
}

/// What every backend attempt of a run shares.
struct RunContext<'a> {
    job_id: &'a str,
    filename: &'a str,
    index: &'a RetrievalIndex,
    query: &'a [f32],
    file_size: usize,
    max_tokens: Option<usize>,
    started: Instant,
}

/// Runs analyses against a fixed registry, log source and index cache.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: Arc<BackendRegistry>,
    source: Arc<dyn LogSource>,
    indexer: Arc<Indexer>,
    cache: Arc<IndexCache>,
    retriever: Retriever,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        registry: Arc<BackendRegistry>,
        source: Arc<dyn LogSource>,
        indexer: Arc<Indexer>,
        cache: Arc<IndexCache>,
    ) -> Self {
        Self {
            settings,
            registry,
            source,
            indexer,
            cache,
            retriever: Retriever::new(),
        }
    }

    /// Everything from configuration: backends, log source, embeddings and
    /// cache.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let registry = Arc::new(BackendRegistry::from_config(config)?);
        let source = source::from_config(&config.source)?;
        Self::with_parts(config, registry, source)
    }

    /// Configuration-driven indexing with an explicit registry and source.
    pub fn with_parts(
        config: &Config,
        registry: Arc<BackendRegistry>,
        source: Arc<dyn LogSource>,
    ) -> anyhow::Result<Self> {
        let chunker = LogChunker::new(config.chunking.max_chunk_chars, config.chunking.overlap_chars)?;
        let indexer = Arc::new(Indexer::new(chunker, embeddings_from_config(&config.embeddings)));
        let cache = Arc::new(IndexCache::new(config.cache.memory_budget_bytes));
        Ok(Self::new(
            OrchestratorSettings::from_config(config),
            registry,
            source,
            indexer,
            cache,
        ))
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<IndexCache> {
        &self.cache
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Filename a request resolves to.
    pub fn filename_for(&self, request: &AnalysisRequest) -> String {
        request
            .filename
            .clone()
            .unwrap_or_else(|| self.settings.default_filename.clone())
    }

    /// Run one analysis to completion, failure or cancellation.
    pub async fn run(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
        events: Option<EventSink>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let filename = self.filename_for(&request);
        let span = info_span!("analysis", job_id = %request.job_id, filename = %filename);

        async move {
            let mut tracker = RunTracker::new(events);
            info!("Starting analysis");

            match self.run_inner(&request, &filename, &cancel, &mut tracker).await {
                Ok(result) => {
                    tracker.enter(PipelineState::Done, None);
                    info!(
                        "Analysis finished with {} in {}ms ({} chunks cited)",
                        result.backend,
                        result.latency_ms,
                        result.cited_chunks.len()
                    );
                    Ok(result)
                }
                Err(err) => Err(tracker.fail(err)),
            }
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        request: &AnalysisRequest,
        filename: &str,
        cancel: &CancellationToken,
        tracker: &mut RunTracker,
    ) -> Result<AnalysisResult, AnalysisError> {
        let started = Instant::now();

        let preferred = self
            .registry
            .resolve(request.backend.as_deref())
            .map_err(|e| AnalysisError::new(ErrorKind::Configuration, PipelineState::Fetching, e.to_string()))?
            .name()
            .to_string();

        tracker.enter(PipelineState::Fetching, None);
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(AnalysisError::cancelled(PipelineState::Fetching)),
            fetched = self.source.fetch(&request.job_id, filename) => {
                fetched.map_err(|e| AnalysisError::from_source(PipelineState::Fetching, e))?
            }
        };
        info!("Fetched log: {} bytes", text.len());

        tracker.enter(PipelineState::Chunking, None);
        let index = tokio::select! {
            _ = cancel.cancelled() => return Err(AnalysisError::cancelled(PipelineState::Chunking)),
            loaded = self.load_index(&request.job_id, filename, &text, &tracker.sink) => loaded?,
        };
        tracker.state = PipelineState::Indexing;

        if index.is_empty() {
            let mut err = AnalysisError::new(ErrorKind::SourceUnavailable, PipelineState::Indexing, "log file is empty");
            err.retryable = false;
            return Err(err);
        }

        let query_text = if request.query.is_empty() {
            self.settings.default_query.clone()
        } else {
            request.query.join(" ")
        };
        let query = tokio::select! {
            _ = cancel.cancelled() => return Err(AnalysisError::cancelled(PipelineState::Indexing)),
            embedded = self.indexer.embeddings().embed(&query_text) => {
                embedded.map_err(|e| AnalysisError::from_embedding(PipelineState::Indexing, e))?
            }
        };

        let ctx = RunContext {
            job_id: &request.job_id,
            filename,
            index: &index,
            query: &query,
            file_size: text.len(),
            max_tokens: request.max_tokens,
            started,
        };

        let mut last_error = None;
        for backend in self.registry.failover_order(&preferred) {
            tracker.backend = Some(backend.name().to_string());
            match self.run_backend(&backend, &ctx, cancel, tracker).await {
                BackendOutcome::Done(result) => return Ok(*result),
                BackendOutcome::Fatal(err) => return Err(err),
                BackendOutcome::Failover(err) => {
                    warn!("Backend {} failed ({}), failing over", backend.name(), err.message);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AnalysisError::internal(tracker.state, "no backends available")))
    }

    /// Lease the index for this log, building or extending it on a miss.
    async fn load_index(
        &self,
        job_id: &str,
        filename: &str,
        text: &str,
        sink: &Option<EventSink>,
    ) -> Result<IndexLease, AnalysisError> {
        let key = IndexCache::key_for(job_id, filename);
        let hash = content_hash(text);
        let indexer = self.indexer.clone();
        let build_sink = sink.clone();
        let build_hash = hash.clone();

        let (lease, built) = self
            .cache
            .get_or_build(&key, &hash, move |stale| async move {
                if let Some(stale) = stale.filter(|s| extends(s, text)) {
                    publish(
                        &build_sink,
                        StateEvent::new(PipelineState::Indexing).with_detail("extending cached index"),
                    );
                    let mut index = (*stale).clone();
                    let appended = &text[index.source_len()..];
                    indexer.extend(&mut index, appended, &build_hash).await?;
                    return Ok::<_, EmbeddingError>(index);
                }

                let chunks = indexer.chunker().split(text);
                publish(
                    &build_sink,
                    StateEvent::new(PipelineState::Indexing).with_detail(format!("embedding {} chunks", chunks.len())),
                );
                let vectors = indexer.embed(&chunks).await?;
                indexer.build(chunks, vectors, build_hash.as_str())
            })
            .await
            .map_err(|e| AnalysisError::from_embedding(PipelineState::Indexing, e))?;

        if !built {
            publish(
                sink,
                StateEvent::new(PipelineState::Indexing).with_detail("using cached index"),
            );
        }
        Ok(lease)
    }

    async fn run_backend(
        &self,
        backend: &Arc<dyn Backend>,
        ctx: &RunContext<'_>,
        cancel: &CancellationToken,
        tracker: &mut RunTracker,
    ) -> BackendOutcome {
        // Prompt tokens the backend accepts once its response is reserved.
        let prompt_limit = backend.context_window().saturating_sub(backend.max_response_tokens());
        let available = prompt_limit.saturating_sub(prompt::overhead_tokens(ctx.job_id, ctx.filename));
        let mut budget = ctx.max_tokens.map_or(available, |cap| cap.min(available));

        'narrow: loop {
            if cancel.is_cancelled() {
                return BackendOutcome::Fatal(AnalysisError::cancelled(tracker.state));
            }

            tracker.enter(PipelineState::Retrieving, Some(format!("budget {} tokens", budget)));
            let retrieval = self.retriever.retrieve(ctx.index, ctx.query, budget);
            if retrieval.is_empty() {
                return BackendOutcome::Fatal(AnalysisError::new(
                    ErrorKind::ContextOverflow,
                    PipelineState::Retrieving,
                    format!("no context fits a budget of {} tokens on {}", budget, backend.name()),
                ));
            }

            tracker.enter(
                PipelineState::Prompting,
                Some(format!("{} chunks, {} tokens", retrieval.len(), retrieval.total_tokens)),
            );
            let request = prompt::build_request(ctx.job_id, ctx.filename, &retrieval, backend.max_response_tokens());

            // Excerpt tags are not part of the budget; shrink it by the excess.
            let prompt_tokens = estimate_tokens(&request.render());
            if prompt_tokens > prompt_limit {
                let shrunk = budget.saturating_sub(prompt_tokens - prompt_limit);
                debug!(
                    "Prompt for {} is {} tokens over its {} token limit, budget {} -> {}",
                    backend.name(),
                    prompt_tokens - prompt_limit,
                    prompt_limit,
                    budget,
                    shrunk
                );
                if shrunk == 0 {
                    return BackendOutcome::Fatal(AnalysisError::new(
                        ErrorKind::ContextOverflow,
                        PipelineState::Prompting,
                        format!("prompt does not fit the {} token window of {}", backend.context_window(), backend.name()),
                    ));
                }
                budget = shrunk;
                continue 'narrow;
            }

            let max_attempts = self.settings.retry.max_attempts.max(1);
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                tracker.enter(
                    PipelineState::Invoking,
                    Some(format!("attempt {}/{}", attempt, max_attempts)),
                );

                let error = match self.invoke_once(backend, request.clone(), cancel).await {
                    Ok(generation) => {
                        tracker.enter(PipelineState::PostProcessing, None);
                        let result = post_process(ctx, backend.as_ref(), &retrieval, generation);
                        return BackendOutcome::Done(Box::new(result));
                    }
                    Err(error) => error,
                };

                match error {
                    BackendError::Cancelled => {
                        return BackendOutcome::Fatal(AnalysisError::cancelled(PipelineState::Invoking));
                    }
                    BackendError::Auth(_) => {
                        return BackendOutcome::Fatal(AnalysisError::from_backend(PipelineState::Invoking, error));
                    }
                    BackendError::ContextOverflow(ref message) => {
                        let narrowed = (budget as f64 * self.settings.narrowing_factor).floor() as usize;
                        if narrowed < self.settings.min_budget_tokens {
                            return BackendOutcome::Fatal(AnalysisError::new(
                                ErrorKind::ContextOverflow,
                                PipelineState::Invoking,
                                format!(
                                    "{}; budget cannot shrink below {} tokens",
                                    message, self.settings.min_budget_tokens
                                ),
                            ));
                        }
                        warn!(
                            "{} reported context overflow, narrowing budget {} -> {}",
                            backend.name(),
                            budget,
                            narrowed
                        );
                        budget = narrowed;
                        continue 'narrow;
                    }
                    _ if error.is_transient() => {
                        if attempt >= max_attempts {
                            return BackendOutcome::Failover(AnalysisError::from_backend(
                                PipelineState::Invoking,
                                error,
                            ));
                        }
                        let delay = self
                            .settings
                            .retry
                            .delay_for_attempt(attempt - 1)
                            .max(error.retry_after().unwrap_or_default());
                        warn!(
                            "{} attempt {}/{} failed ({}), retrying in {}ms",
                            backend.name(),
                            attempt,
                            max_attempts,
                            error,
                            delay.as_millis()
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return BackendOutcome::Fatal(AnalysisError::cancelled(PipelineState::Invoking));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    _ => {
                        return BackendOutcome::Failover(AnalysisError::from_backend(PipelineState::Invoking, error));
                    }
                }
            }
        }
    }

    /// One backend call in its own task, bounded by the invoke timeout and
    /// raced against cancellation.
    async fn invoke_once(
        &self,
        backend: &Arc<dyn Backend>,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, BackendError> {
        let timeout = self.settings.invoke_timeout;
        let task_backend = backend.clone();
        let mut handle = tokio::spawn(async move { tokio::time::timeout(timeout, task_backend.invoke(request)).await });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(BackendError::Timeout(format!(
                    "no response within {}s",
                    timeout.as_secs_f64()
                ))),
                Err(join_error) => Err(BackendError::Unavailable(format!("backend task failed: {}", join_error))),
            },
            _ = cancel.cancelled() => {
                if backend.supports_cancellation() {
                    handle.abort();
                    debug!("Aborted in-flight call to {}", backend.name());
                } else {
                    debug!("Detached in-flight call to {}; its result will be discarded", backend.name());
                }
                Err(BackendError::Cancelled)
            }
        }
    }
}

/// Whether `text` is the cached log with more appended after a full line.
fn extends(stale: &RetrievalIndex, text: &str) -> bool {
    let len = stale.source_len();
    len > 0
        && len < text.len()
        && text.is_char_boundary(len)
        && text[..len].ends_with('\n')
        && content_hash(&text[..len]) == stale.content_hash()
}

fn post_process(
    ctx: &RunContext<'_>,
    backend: &dyn Backend,
    retrieval: &Retrieval,
    generation: GenerationResult,
) -> AnalysisResult {
    let sent: Vec<usize> = retrieval.chunks().map(|c| c.id().0).collect();
    let cited_ids = prompt::extract_citations(&generation.text, &sent);
    let cited_chunks = cited_ids
        .iter()
        .filter_map(|id| retrieval.chunks().find(|c| c.id().0 == *id))
        .map(CitedChunk::from)
        .collect();

    AnalysisResult {
        job_id: ctx.job_id.to_string(),
        filename: ctx.filename.to_string(),
        backend: backend.name().to_string(),
        model: backend.model().to_string(),
        explanation: generation.text,
        cited_chunks,
        tokens_used: generation.usage.total_tokens,
        usage: generation.usage,
        latency_ms: ctx.started.elapsed().as_millis() as u64,
        analysis_method: if retrieval.exhaustive {
            AnalysisMethod::Full
        } else {
            AnalysisMethod::Rag
        },
        context_tokens: retrieval.total_tokens,
        truncated: retrieval.truncated,
        file_size: ctx.file_size,
        finish_reason: generation.finish_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticLogSource;
    use gla_providers::ScriptedBackend;

    fn small_log() -> String {
        let mut log = String::new();
        for i in 0..40 {
            log.push_str(&format!("{:04} INFO heartbeat ok\n", i));
        }
        log.push_str("0040 ERROR stage-out failed: no space left on device\n");
        log
    }

    fn orchestrator(backends: Vec<Arc<dyn Backend>>, source: Arc<StaticLogSource>) -> Orchestrator {
        let mut config = Config::default();
        config.chunking.max_chunk_chars = 300;
        config.chunking.overlap_chars = 30;
        config.retry.initial_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        let registry = Arc::new(BackendRegistry::new(backends, None).unwrap());
        Orchestrator::with_parts(&config, registry, source).unwrap()
    }

    #[tokio::test]
    async fn test_full_run_emits_states_in_order() {
        let source = Arc::new(StaticLogSource::new().with_log("1", "pilotlog.txt", small_log()));
        let backend = Arc::new(ScriptedBackend::new("llama"));
        let orch = orchestrator(vec![backend.clone()], source);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = orch
            .run(AnalysisRequest::new("1"), CancellationToken::new(), Some(tx))
            .await
            .unwrap();

        assert_eq!(result.backend, "llama");
        assert_eq!(result.analysis_method, AnalysisMethod::Full);
        assert_eq!(result.file_size, small_log().len());
        assert!(!result.cited_chunks.is_empty());
        assert_eq!(backend.calls(), 1);

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if states.last() != Some(&event.state) {
                states.push(event.state);
            }
        }
        assert_eq!(
            states,
            vec![
                PipelineState::Fetching,
                PipelineState::Chunking,
                PipelineState::Indexing,
                PipelineState::Retrieving,
                PipelineState::Prompting,
                PipelineState::Invoking,
                PipelineState::PostProcessing,
                PipelineState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_log_fails_in_fetching() {
        let source = Arc::new(StaticLogSource::new());
        let orch = orchestrator(vec![Arc::new(ScriptedBackend::new("llama"))], source);
        let err = orch
            .run(AnalysisRequest::new("404"), CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SourceUnavailable);
        assert_eq!(err.state, PipelineState::Fetching);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_configuration_error() {
        let source = Arc::new(StaticLogSource::new().with_log("1", "pilotlog.txt", small_log()));
        let orch = orchestrator(vec![Arc::new(ScriptedBackend::new("llama"))], source.clone());
        let err = orch
            .run(AnalysisRequest::new("1").with_backend("gpt"), CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(source.fetches(), 0);
    }

    #[test]
    fn test_extends_requires_whole_line_prefix() {
        let mut index = RetrievalIndex::new(1, content_hash("a\nb\n"));
        index
            .insert(gla_index::LogChunk::new(gla_index::ChunkId(0), 0..4, 1, 2, "a\nb\n".to_string()).with_embedding(vec![1.0]))
            .unwrap();
        assert!(extends(&index, "a\nb\nc\n"));
        assert!(!extends(&index, "a\nb\n"));
        assert!(!extends(&index, "x\nb\nc\n"));
    }
}
