//! HTTP routes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, StreamExt};
use gla_core::protocol::{AnalyzeRequest, RunInfo, SessionInfo, StatusResponse, StreamEvent, REQUEST_TOKEN_HEADER};
use gla_core::source::{validate_filename, validate_job_id};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::error::{analysis_error_response, ApiError, ApiResult};
use crate::session::Session;

const SERVICE_NAME: &str = "gla";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// How long a synchronous analyze call waits before giving up.
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, request_timeout: Duration) -> Self {
        Self {
            coordinator,
            request_timeout,
        }
    }
}

pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/analyze", post(analyze))
        .route("/runs/:token", get(run_info).delete(cancel_run))
        .route("/runs/:token/events", get(run_events))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let registry = state.coordinator.orchestrator().registry();
    Json(StatusResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        message: "Grid job failure analyzer is running".to_string(),
        available_backends: registry.summaries(),
        default_backend: registry.default_name().to_string(),
        active_runs: state.coordinator.active_runs(),
    })
}

async fn analyze(
    State(state): State<AppState>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body.map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;

    validate_job_id(&body.job_id).map_err(|e| ApiError::validation(e.to_string()))?;
    if let Some(filename) = &body.filename {
        validate_filename(filename).map_err(|e| ApiError::validation(e.to_string()))?;
    }
    if body.max_tokens == Some(0) {
        return Err(ApiError::validation("maxTokens must be positive"));
    }

    let (session, joined) = state.coordinator.submit(body.to_analysis_request());
    info!(
        "analyze job={} token={} joined={} stream={}",
        body.job_id,
        session.token(),
        joined,
        body.stream
    );

    if body.stream {
        let intro = SessionInfo {
            token: session.token().to_string(),
            joined,
        };
        return Ok(sse_response(session, 0, Some(intro)));
    }

    let headers = token_headers(session.token());
    match tokio::time::timeout(state.request_timeout, session.wait()).await {
        Ok(Ok(result)) => Ok((headers, Json(result)).into_response()),
        Ok(Err(error)) => Ok((headers, analysis_error_response(error)).into_response()),
        Err(_) => {
            warn!("Run {} still running after {:?}", session.token(), state.request_timeout);
            Ok((
                headers,
                ApiError::timeout(format!(
                    "analysis still running; poll /runs/{} for the outcome",
                    session.token()
                )),
            )
                .into_response())
        }
    }
}

async fn run_info(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult<Json<RunInfo>> {
    let session = state
        .coordinator
        .session(&token)
        .ok_or_else(|| ApiError::not_found(format!("run {}", token)))?;
    Ok(Json(session.info()))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after: usize,
}

async fn run_events(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Response> {
    let session = state
        .coordinator
        .session(&token)
        .ok_or_else(|| ApiError::not_found(format!("run {}", token)))?;
    Ok(sse_response(session, query.after, None))
}

async fn cancel_run(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult<StatusCode> {
    if state.coordinator.cancel(&token) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("run {}", token)))
    }
}

fn token_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(token) {
        headers.insert(HeaderName::from_static(REQUEST_TOKEN_HEADER), value);
    }
    headers
}

fn sse_response(session: Arc<Session>, after: usize, intro: Option<SessionInfo>) -> Response {
    let headers = token_headers(session.token());
    let intro = stream::iter(intro.map(|info| to_sse(None, &StreamEvent::Session(info))));
    let events = session.events(after).map(|(seq, event)| to_sse(Some(seq), &event));
    let stream = intro.chain(events).map(Ok::<_, Infallible>);

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    );
    (headers, sse).into_response()
}

fn to_sse(seq: Option<usize>, event: &StreamEvent) -> Event {
    let data = match event.to_json() {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to encode {} event: {}", event.name(), e);
            String::from("{}")
        }
    };
    let sse = Event::default().event(event.name()).data(data);
    match seq {
        Some(seq) => sse.id(seq.to_string()),
        None => sse,
    }
}
