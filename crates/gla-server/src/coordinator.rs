//! Run coordination: deduplicates concurrent identical requests, tracks
//! sessions by token and isolates each run in its own task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use gla_core::{AnalysisError, AnalysisRequest, AnalysisResult, Orchestrator};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::session::{RunKey, Session};

#[derive(Default)]
struct CoordinatorState {
    /// Runs still executing, by key.
    in_flight: HashMap<RunKey, Arc<Session>>,
    /// Every resolvable session, by token.
    sessions: HashMap<String, Arc<Session>>,
}

pub struct Coordinator {
    orchestrator: Arc<Orchestrator>,
    state: Mutex<CoordinatorState>,
    retention: Duration,
}

impl Coordinator {
    pub fn new(orchestrator: Arc<Orchestrator>, retention: Duration) -> Self {
        Self {
            orchestrator,
            state: Mutex::new(CoordinatorState::default()),
            retention,
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Key a request deduplicates on.
    pub fn run_key(&self, request: &AnalysisRequest) -> RunKey {
        RunKey {
            job_id: request.job_id.clone(),
            filename: self.orchestrator.filename_for(request),
            backend: request
                .backend
                .clone()
                .unwrap_or_else(|| self.orchestrator.registry().default_name().to_string()),
        }
    }

    /// Start a run, or join the identical one already in flight. Returns the
    /// session and whether it was joined.
    pub fn submit(self: &Arc<Self>, request: AnalysisRequest) -> (Arc<Session>, bool) {
        let key = self.run_key(&request);

        let session = {
            let mut state = self.state();
            if let Some(existing) = state.in_flight.get(&key).filter(|s| !s.is_cancelled()) {
                debug!("Joining in-flight run {} for {:?}", existing.token(), key);
                return (existing.clone(), true);
            }

            let session = Arc::new(Session::new(Uuid::new_v4().to_string(), key.clone()));
            state.in_flight.insert(key, session.clone());
            state.sessions.insert(session.token().to_string(), session.clone());
            session
        };

        info!(
            "Starting run {} for job {} ({})",
            session.token(),
            session.key().job_id,
            session.key().backend
        );
        self.spawn_run(session.clone(), request);
        (session, false)
    }

    fn spawn_run(self: &Arc<Self>, session: Arc<Session>, request: AnalysisRequest) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();

            let forward = {
                let session = session.clone();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        session.push_state(event);
                    }
                })
            };

            let run = {
                let orchestrator = coordinator.orchestrator.clone();
                let cancel = session.cancel_token();
                tokio::spawn(async move { orchestrator.run(request, cancel, Some(tx)).await })
            };

            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    error!("Run {} panicked: {}", session.token(), join_error);
                    Err(AnalysisError::internal(
                        session.last_state(),
                        format!("analysis task failed: {}", join_error),
                    ))
                }
            };

            // The sender is gone once the run task ends, so this drains and stops.
            let _ = forward.await;
            coordinator.complete(&session, outcome);
        });
    }

    fn complete(&self, session: &Arc<Session>, outcome: Result<AnalysisResult, AnalysisError>) {
        {
            let mut state = self.state();
            if state
                .in_flight
                .get(session.key())
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                state.in_flight.remove(session.key());
            }
            if session.is_cancelled() {
                state.sessions.remove(session.token());
            }
        }

        match &outcome {
            Ok(result) => debug!("Run {} done in {}ms", session.token(), result.latency_ms),
            Err(err) => debug!("Run {} failed: {}", session.token(), err),
        }
        session.finish(outcome);
    }

    pub fn session(&self, token: &str) -> Option<Arc<Session>> {
        self.state().sessions.get(token).cloned()
    }

    /// Cancel a run and forget its session. Returns false for unknown tokens.
    pub fn cancel(&self, token: &str) -> bool {
        let session = {
            let mut state = self.state();
            let Some(session) = state.sessions.remove(token) else {
                return false;
            };
            if state
                .in_flight
                .get(session.key())
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                state.in_flight.remove(session.key());
            }
            session
        };

        info!("Cancelling run {}", token);
        session.cancel();
        true
    }

    pub fn active_runs(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Forget sessions that finished longer than the retention period ago.
    pub fn prune_finished(&self) -> usize {
        let mut state = self.state();
        let before = state.sessions.len();
        let retention = self.retention;
        state
            .sessions
            .retain(|_, session| session.finished_at().map_or(true, |at| at.elapsed() < retention));
        let pruned = before - state.sessions.len();
        if pruned > 0 {
            debug!("Pruned {} finished sessions", pruned);
        }
        pruned
    }

    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        coordinator.prune_finished();
                    }
                }
            }
            debug!("Session pruner stopped");
        })
    }
}
