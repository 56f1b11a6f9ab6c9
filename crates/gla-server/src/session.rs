//! Per-run bookkeeping shared by every request attached to one analysis.
//!
//! A session records the ordered event history of its run so late joiners
//! and reconnecting clients can replay what they missed. Sequence numbers
//! are 1-based positions in that history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures_util::stream::{self, Stream};
use gla_core::protocol::{RunInfo, RunStatus, StreamEvent};
use gla_core::{AnalysisError, AnalysisResult, PipelineState, StateEvent};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Identity of a run for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub job_id: String,
    pub filename: String,
    pub backend: String,
}

#[derive(Default)]
struct SessionInner {
    history: Vec<StreamEvent>,
    outcome: Option<Result<AnalysisResult, AnalysisError>>,
    finished_at: Option<Instant>,
}

pub struct Session {
    token: String,
    key: RunKey,
    cancel: CancellationToken,
    inner: Mutex<SessionInner>,
    /// Carries the history length; bumped on every push.
    updates: watch::Sender<usize>,
}

impl Session {
    pub fn new(token: impl Into<String>, key: RunKey) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            token: token.into(),
            key,
            cancel: CancellationToken::new(),
            inner: Mutex::new(SessionInner::default()),
            updates,
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a state transition. Ignored once the run has finished.
    pub fn push_state(&self, event: StateEvent) {
        self.push(StreamEvent::State(event));
    }

    /// Record the outcome and the matching terminal event. Only the first
    /// outcome counts.
    pub fn finish(&self, outcome: Result<AnalysisResult, AnalysisError>) {
        let terminal = match &outcome {
            Ok(result) => StreamEvent::Result(Box::new(result.clone())),
            Err(error) => StreamEvent::Error(error.clone()),
        };

        let len = {
            let mut inner = self.inner();
            if inner.outcome.is_some() {
                return;
            }
            inner.history.push(terminal);
            inner.outcome = Some(outcome);
            inner.finished_at = Some(Instant::now());
            inner.history.len()
        };
        self.updates.send_replace(len);
    }

    fn push(&self, event: StreamEvent) {
        let len = {
            let mut inner = self.inner();
            if inner.outcome.is_some() {
                return;
            }
            inner.history.push(event);
            inner.history.len()
        };
        self.updates.send_replace(len);
    }

    pub fn outcome(&self) -> Option<Result<AnalysisResult, AnalysisError>> {
        self.inner().outcome.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.inner().outcome.is_some()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.inner().finished_at
    }

    /// Number of sequenced events so far.
    pub fn event_count(&self) -> usize {
        self.inner().history.len()
    }

    /// Last pipeline state the run reported.
    pub fn last_state(&self) -> PipelineState {
        self.inner()
            .history
            .iter()
            .rev()
            .find_map(|event| match event {
                StreamEvent::State(state) => Some(state.state),
                _ => None,
            })
            .unwrap_or(PipelineState::Fetching)
    }

    /// Events with a sequence number above `after`, and whether the history
    /// is complete.
    pub fn events_after(&self, after: usize) -> (Vec<(usize, StreamEvent)>, bool) {
        let inner = self.inner();
        let events = inner
            .history
            .iter()
            .enumerate()
            .skip(after)
            .map(|(i, event)| (i + 1, event.clone()))
            .collect();
        (events, inner.outcome.is_some())
    }

    /// Wait for the run to finish.
    pub async fn wait(&self) -> Result<AnalysisResult, AnalysisError> {
        let mut rx = self.updates.subscribe();
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(AnalysisError::internal(self.last_state(), "session closed"));
            }
        }
    }

    /// Replay the history after `after`, then follow live events until the
    /// terminal one.
    pub fn events(self: &Arc<Self>, after: usize) -> impl Stream<Item = (usize, StreamEvent)> + Send + 'static {
        let rx = self.updates.subscribe();
        let start = (self.clone(), rx, after, VecDeque::new(), false);

        stream::unfold(start, |(session, mut rx, mut cursor, mut pending, mut complete)| async move {
            loop {
                if let Some((seq, event)) = pending.pop_front() {
                    cursor = seq;
                    return Some(((seq, event), (session, rx, cursor, pending, complete)));
                }
                if complete {
                    return None;
                }

                let (batch, finished) = session.events_after(cursor);
                if !batch.is_empty() {
                    pending.extend(batch);
                    complete = finished;
                    continue;
                }
                if finished || rx.changed().await.is_err() {
                    return None;
                }
            }
        })
    }

    pub fn info(&self) -> RunInfo {
        let inner = self.inner();
        let (status, result, error) = match &inner.outcome {
            None => (RunStatus::Running, None, None),
            Some(Ok(result)) => (RunStatus::Done, Some(result.clone()), None),
            Some(Err(error)) => (RunStatus::Failed, None, Some(error.clone())),
        };
        RunInfo {
            token: self.token.clone(),
            job_id: self.key.job_id.clone(),
            filename: self.key.filename.clone(),
            backend: self.key.backend.clone(),
            status,
            events: inner.history.len(),
            result,
            error,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("key", &self.key)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use gla_core::ErrorKind;

    fn session() -> Arc<Session> {
        Arc::new(Session::new(
            "token-1",
            RunKey {
                job_id: "1".to_string(),
                filename: "pilotlog.txt".to_string(),
                backend: "llama".to_string(),
            },
        ))
    }

    fn failure() -> AnalysisError {
        AnalysisError::new(ErrorKind::Auth, PipelineState::Invoking, "bad key")
    }

    #[test]
    fn test_events_after_uses_one_based_sequence() {
        let session = session();
        session.push_state(StateEvent::new(PipelineState::Fetching));
        session.push_state(StateEvent::new(PipelineState::Chunking));

        let (events, finished) = session.events_after(1);
        assert!(!finished);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 2);
        assert_eq!(session.last_state(), PipelineState::Chunking);
    }

    #[test]
    fn test_finish_is_final() {
        let session = session();
        session.finish(Err(failure()));
        session.push_state(StateEvent::new(PipelineState::Invoking));
        session.finish(Err(AnalysisError::cancelled(PipelineState::Invoking)));

        assert_eq!(session.event_count(), 1);
        assert_eq!(session.outcome(), Some(Err(failure())));
        assert_eq!(session.info().status, RunStatus::Failed);
        assert!(session.finished_at().is_some());
    }

    #[tokio::test]
    async fn test_stream_follows_live_events_until_terminal() {
        let session = session();
        session.push_state(StateEvent::new(PipelineState::Fetching));

        let follower = {
            let stream = session.events(0);
            tokio::spawn(async move { stream.collect::<Vec<_>>().await })
        };

        tokio::task::yield_now().await;
        session.push_state(StateEvent::new(PipelineState::Invoking));
        session.finish(Err(failure()));

        let events = follower.await.unwrap();
        let seqs: Vec<usize> = events.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(events[2].1.is_terminal());
    }

    #[tokio::test]
    async fn test_resume_replays_only_unseen() {
        let session = session();
        session.push_state(StateEvent::new(PipelineState::Fetching));
        session.push_state(StateEvent::new(PipelineState::Chunking));
        session.finish(Err(failure()));

        let events: Vec<_> = session.events(2).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 3);

        let events: Vec<_> = session.events(3).collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_wait_returns_outcome() {
        let session = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait().await })
        };
        tokio::task::yield_now().await;
        session.finish(Err(failure()));
        assert_eq!(waiter.await.unwrap(), Err(failure()));
    }
}
