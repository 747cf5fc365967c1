//! HTTP adapter: REST endpoints for job submission and inspection, an SSE
//! stream of per-job events, and bot lifecycle controls.
//!
//! This is one adapter among possible many; everything it does goes
//! through the message router, approval service, and agent registry, so a
//! chat adapter would reuse the same seams.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use crate::agent_loop::AgentLoopRegistry;
use crate::approvals::{ApprovalDecision, ApprovalService};
use crate::bots::{BotManager, CreateBot};
use crate::config::AppConfig;
use crate::errors::SubmitError;
use crate::events::{EventDispatcher, TaskEvent};
use crate::models::{IdleBehavior, InboundMessage, JobStatus, Verbosity};
use crate::router::MessageRouter;

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub router: Arc<MessageRouter>,
    pub approvals: Arc<ApprovalService>,
    pub dispatcher: Arc<EventDispatcher>,
    pub agents: Arc<AgentLoopRegistry>,
    pub bots: Arc<BotManager>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    pub project_id: String,
    pub instruction: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub verbosity: Option<Verbosity>,
}

#[derive(Deserialize)]
pub struct ApprovalRequest {
    pub decision: ApprovalDecision,
}

#[derive(Deserialize)]
pub struct CreateBotRequest {
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub engine_type: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub poll_interval_seconds: Option<u64>,
    #[serde(default)]
    pub max_concurrent_stories: Option<usize>,
    #[serde(default)]
    pub idle_behavior: Option<IdleBehavior>,
}

// ── Error handling ───────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match &err {
            SubmitError::ProjectNotFound { .. }
            | SubmitError::BotNotFound { .. }
            | SubmitError::JobNotFound { .. } => ApiError::NotFound(err.to_string()),
            SubmitError::Validation(_) => ApiError::BadRequest(err.to_string()),
            SubmitError::NotAwaitingApproval { .. } => ApiError::Conflict(err.to_string()),
            SubmitError::Queue(_) => ApiError::Unavailable(err.to_string()),
            SubmitError::Other(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Router ───────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/events", get(job_events))
        .route("/api/jobs/{id}/approval", post(resolve_approval))
        .route("/api/bots", get(list_bots).post(create_bot))
        .route("/api/bots/{id}/start", post(start_bot))
        .route("/api/bots/{id}/stop", post(stop_bot))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn submit_job(
    State(state): State<SharedState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = InboundMessage {
        channel: "rest".to_string(),
        channel_message_id: None,
        user_id: req.user_id.unwrap_or_else(|| "anonymous".to_string()),
        project_id: req.project_id,
        bot_id: req.bot_id,
        story_id: None,
        instruction: req.instruction,
        verbosity: req.verbosity,
        attachments: Vec::new(),
    };
    let job = state.router.submit(message).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .router
        .get_job(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {}", id)))?;
    Ok(Json(job))
}

/// SSE stream of a single job's events, ending after the terminal event.
/// A job already in a terminal state yields one synthetic terminal event.
async fn job_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .router
        .get_job(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {}", id)))?;

    if job.status.is_terminal() {
        let event = match job.status {
            JobStatus::Failed => TaskEvent::TaskFailed {
                error: job.error.clone().unwrap_or_default(),
                job,
            },
            _ => TaskEvent::TaskCompleted { job },
        };
        let stream: BoxStream<'static, Result<SseEvent, Infallible>> =
            stream::iter(vec![Ok(sse_event(&event))]).boxed();
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()));
    }

    let rx = state.dispatcher.stream();
    let stream = stream::unfold(Some(rx), move |rx| {
        let id = id.clone();
        async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(event) if event.job_id() == id => {
                        let done = event.is_terminal();
                        let next = if done { None } else { Some(rx) };
                        return Some((Ok(sse_event(&event)), next));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    })
    .boxed();

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &TaskEvent) -> SseEvent {
    match SseEvent::default().json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::error!(error = %e, "Event serialization failed");
            SseEvent::default().data("{}")
        }
    }
}

async fn resolve_approval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.approvals.resolve(&id, req.decision).await?;
    Ok(Json(job))
}

async fn list_bots(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let bots = state.bots.list().await?;
    Ok(Json(bots))
}

async fn create_bot(
    State(state): State<SharedState>,
    Json(req): Json<CreateBotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config.projects.contains_key(&req.project_id) {
        return Err(ApiError::NotFound(format!(
            "Project not found: {}",
            req.project_id
        )));
    }
    let bot = state
        .bots
        .create(CreateBot {
            name: req.name,
            project_id: req.project_id,
            engine_type: req
                .engine_type
                .unwrap_or_else(|| state.config.engine.default_type.clone()),
            model: req.model,
            system_prompt: req.system_prompt,
            poll_interval_seconds: req
                .poll_interval_seconds
                .unwrap_or(state.config.agent.poll_interval_seconds),
            max_concurrent_stories: req
                .max_concurrent_stories
                .unwrap_or(state.config.agent.max_concurrent_stories),
            idle_behavior: req.idle_behavior.unwrap_or(IdleBehavior::Wait),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(bot)))
}

async fn start_bot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let started = state
        .agents
        .start(&id)
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(Json(serde_json::json!({"started": started})))
}

async fn stop_bot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.agents.stop(&id).await?;
    Ok(Json(serde_json::json!({"stopped": true})))
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: SharedState,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;
    Ok(())
}
