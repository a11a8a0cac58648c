use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use sluice_core::{JobKey, StreamEvent};
use sluice_hub::Attached;
use sluice_telemetry::{names, HubMetrics, MetricsSnapshot};

use crate::error::ApiError;
use crate::pipeline::RunRequest;
use crate::server::AppState;

/// Response header carrying the job key a request attached to.
pub const JOB_KEY_HEADER: HeaderName = HeaderName::from_static("x-sluice-job-key");
/// `true` when the request started the execution, `false` when it attached.
pub const JOB_CREATED_HEADER: HeaderName = HeaderName::from_static("x-sluice-job-created");

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub cursor: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub key: JobKey,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatus {
    pub key: JobKey,
    pub done: bool,
    pub events: usize,
    pub error: Option<String>,
    pub age_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub jobs: usize,
    pub running: usize,
    pub pipelines: Vec<String>,
}

/// Holds the `subscribers_active` gauge up for as long as a response
/// stream is alive.
struct SubscriberGuard(Arc<HubMetrics>);

impl SubscriberGuard {
    fn new(metrics: &Arc<HubMetrics>) -> Self {
        metrics.gauge_inc(names::SUBSCRIBERS_ACTIVE, 1);
        Self(Arc::clone(metrics))
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.gauge_inc(names::SUBSCRIBERS_ACTIVE, -1);
    }
}

/// Resolve the pipeline, validate the body and attach to (or start) the
/// job its key maps to.
fn attach(
    state: &AppState,
    name: &str,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Attached, ApiError> {
    let pipeline = state
        .pipelines
        .get(name)
        .ok_or_else(|| ApiError::UnknownPipeline(name.to_string()))?;
    let Json(request) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    request.validate()?;

    let run = pipeline.run_info(&request);
    let runner = Arc::clone(pipeline.runner());
    let attached = state
        .hub
        .get_or_create(run.key.clone(), move |job| async move { runner.run(job, run).await })?;

    info!(
        pipeline = name,
        job_key = %attached.job.key(),
        created = attached.created,
        "request attached"
    );
    Ok(attached)
}

/// `POST /v1/pipelines/{name}/stream`: replay from `cursor` (default 0),
/// then live events until `done`.
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<StreamQuery>, QueryRejection>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let attached = attach(&state, &name, body)?;

    let key = HeaderValue::from_str(attached.job.key().as_str())
        .map_err(|e| ApiError::Internal(format!("job key is not a valid header: {e}")))?;
    let created = HeaderValue::from_static(if attached.created { "true" } else { "false" });

    let guard = SubscriberGuard::new(state.hub.metrics());
    let job_key = attached.job.key().clone();
    let events = attached.job.subscribe(query.cursor).map(move |event| {
        let _live = &guard;
        if event.is_done() {
            debug!(job_key = %job_key, "subscription reached done");
        }
        Ok::<_, Infallible>(Event::default().data(event.to_json()))
    });

    let sse = Sse::new(events);
    let headers = [(JOB_KEY_HEADER, key), (JOB_CREATED_HEADER, created)];
    if let Some(interval) = state.keep_alive {
        let sse = sse.keep_alive(KeepAlive::new().interval(interval));
        return Ok((headers, sse).into_response());
    }
    Ok((headers, sse).into_response())
}

/// `POST /v1/pipelines/{name}/invoke`: wait for the same job the stream
/// endpoint would attach to and fold it into its last result and error.
pub async fn invoke_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<InvokeResponse>, ApiError> {
    let attached = attach(&state, &name, body)?;
    let _guard = SubscriberGuard::new(state.hub.metrics());

    let mut result = None;
    let mut error = None;
    let mut events = attached.job.subscribe(0);
    while let Some(event) = events.next().await {
        match event.as_ref() {
            StreamEvent::Result { data } => result = Some(data.clone()),
            StreamEvent::Error { message } => error = Some(message.clone()),
            _ => {}
        }
    }

    Ok(Json(InvokeResponse {
        key: attached.job.key().clone(),
        result,
        error,
    }))
}

/// `GET /v1/jobs/{key}`
pub async fn job_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    let key = JobKey::from_raw(key);
    let job = state
        .hub
        .get(&key)
        .ok_or_else(|| ApiError::UnknownJob(key.to_string()))?;

    Ok(Json(JobStatus {
        key,
        done: job.is_done(),
        events: job.len(),
        error: job.terminal_error(),
        age_ms: u64::try_from(job.age().as_millis()).unwrap_or(u64::MAX),
    }))
}

/// `GET /v1/stats`
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        metrics: state.hub.metrics().snapshot(),
        jobs: state.hub.len(),
        running: state.hub.running_count(),
        pipelines: state.pipelines.names(),
    })
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let shutting_down = state.hub.is_shutting_down();
    let body = serde_json::json!({
        "status": if shutting_down { "shutting_down" } else { "healthy" },
        "jobs": state.hub.len(),
        "running": state.hub.running_count(),
    });

    let http_status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (http_status, Json(body))
}
