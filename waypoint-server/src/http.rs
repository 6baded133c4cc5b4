//! Waypoint HTTP REST API
//!
//! Axum server exposing workflow runs, conversational memory and agents over
//! JSON. Runs alongside the Unix socket IPC server on port 8767 (configurable).
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, Value)`. The inner functions build a
//! [`WaypointRequest`] and go through the same router as the IPC server.
//!
//! Endpoints:
//! - GET   /health                     : storage health
//! - GET   /version                    : server version info
//! - POST  /workflows/:id/runs         : start a run (body = workflow input)
//! - GET   /runs/:id                   : run snapshot
//! - POST  /runs/:id/resume            : resume a suspended run (body = resume input)
//! - POST  /runs/:id/fail              : mark a run failed
//! - POST  /memory/context             : assemble context for a new user message
//! - GET   /memory/:resource/working   : working memory document
//! - PATCH /memory/:resource/working   : merge a patch into working memory
//! - POST  /agents/:name/generate      : call an agent

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;
use waypoint_core::ipc::{WaypointRequest, WaypointResponse, PROTOCOL_VERSION};
use waypoint_core::models::NewMessage;
use waypoint_core::Schema;

use crate::app::App;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub app: Arc<App>,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/workflows/:id/runs", post(start_run_handler))
        .route("/runs/:id", get(get_run_handler))
        .route("/runs/:id/resume", post(resume_run_handler))
        .route("/runs/:id/fail", post(fail_run_handler))
        .route("/memory/context", post(context_handler))
        .route(
            "/memory/:resource/working",
            get(get_working_memory_handler).patch(merge_working_memory_handler),
        )
        .route("/agents/:name/generate", post(generate_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(app: Arc<App>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = format!("{}:{}", app.config.http.host, app.config.http.port);
    let state = Arc::new(HttpState { app });

    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Waypoint HTTP API listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FailRunRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContextRequest {
    pub resource_id: String,
    pub thread_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub messages: Vec<NewMessage>,
    #[serde(default)]
    pub output_schema: Option<Schema>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

pub async fn health_inner(app: &App) -> (StatusCode, Value) {
    let response = crate::router::handle_request(WaypointRequest::Health, app).await;
    match response_to_http(response) {
        Ok(mut data) => {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("version".to_string(), json!(PROTOCOL_VERSION));
                obj.insert("socket".to_string(), json!(app.config.service.socket_path));
            }
            (StatusCode::OK, data)
        }
        Err((_, body)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "status": "unhealthy",
                "error": body["error"],
            }),
        ),
    }
}

pub fn version_inner() -> Value {
    json!({
        "version": PROTOCOL_VERSION,
        "protocol": "waypoint/1",
    })
}

pub async fn start_run_inner(app: &App, workflow_id: String, input: Value) -> (StatusCode, Value) {
    dispatch(app, WaypointRequest::StartRun { workflow_id, input }).await
}

pub async fn get_run_inner(app: &App, run_id: Uuid) -> (StatusCode, Value) {
    dispatch(app, WaypointRequest::GetRun { run_id }).await
}

pub async fn resume_run_inner(app: &App, run_id: Uuid, input: Value) -> (StatusCode, Value) {
    dispatch(app, WaypointRequest::ResumeRun { run_id, input }).await
}

pub async fn fail_run_inner(app: &App, run_id: Uuid, req: FailRunRequest) -> (StatusCode, Value) {
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "cancelled by operator".to_string());
    dispatch(app, WaypointRequest::FailRun { run_id, reason }).await
}

pub async fn context_inner(app: &App, req: ContextRequest) -> (StatusCode, Value) {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            json!({
                "error": "message field is required",
                "status": "error",
            }),
        );
    }
    dispatch(
        app,
        WaypointRequest::AssembleContext {
            resource_id: req.resource_id,
            thread_id: req.thread_id,
            message: req.message,
        },
    )
    .await
}

pub async fn get_working_memory_inner(app: &App, resource_id: String) -> (StatusCode, Value) {
    dispatch(app, WaypointRequest::GetWorkingMemory { resource_id }).await
}

pub async fn merge_working_memory_inner(app: &App, resource_id: String, patch: Value) -> (StatusCode, Value) {
    dispatch(app, WaypointRequest::MergeWorkingMemory { resource_id, patch }).await
}

pub async fn generate_inner(app: &App, agent: String, req: GenerateRequest) -> (StatusCode, Value) {
    if req.messages.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            json!({
                "error": "messages must not be empty",
                "status": "error",
            }),
        );
    }
    dispatch(
        app,
        WaypointRequest::Generate {
            agent,
            messages: req.messages,
            output_schema: req.output_schema,
            resource_id: req.resource_id,
            thread_id: req.thread_id,
        },
    )
    .await
}

// ============================================================================
// Axum handler wrappers (thin: delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.app).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn start_run_handler(
    State(state): State<Arc<HttpState>>,
    Path(workflow_id): Path<String>,
    Json(input): Json<Value>,
) -> impl IntoResponse {
    let (status, body) = start_run_inner(&state.app, workflow_id, input).await;
    (status, Json(body))
}

pub async fn get_run_handler(
    State(state): State<Arc<HttpState>>,
    Path(run_id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = get_run_inner(&state.app, run_id).await;
    (status, Json(body))
}

pub async fn resume_run_handler(
    State(state): State<Arc<HttpState>>,
    Path(run_id): Path<Uuid>,
    Json(input): Json<Value>,
) -> impl IntoResponse {
    let (status, body) = resume_run_inner(&state.app, run_id, input).await;
    (status, Json(body))
}

pub async fn fail_run_handler(
    State(state): State<Arc<HttpState>>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<FailRunRequest>,
) -> impl IntoResponse {
    let (status, body) = fail_run_inner(&state.app, run_id, req).await;
    (status, Json(body))
}

pub async fn context_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ContextRequest>,
) -> impl IntoResponse {
    let (status, body) = context_inner(&state.app, req).await;
    (status, Json(body))
}

pub async fn get_working_memory_handler(
    State(state): State<Arc<HttpState>>,
    Path(resource_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = get_working_memory_inner(&state.app, resource_id).await;
    (status, Json(body))
}

pub async fn merge_working_memory_handler(
    State(state): State<Arc<HttpState>>,
    Path(resource_id): Path<String>,
    Json(patch): Json<Value>,
) -> impl IntoResponse {
    let (status, body) = merge_working_memory_inner(&state.app, resource_id, patch).await;
    (status, Json(body))
}

pub async fn generate_handler(
    State(state): State<Arc<HttpState>>,
    Path(agent): Path<String>,
    Json(req): Json<GenerateRequest>,
) -> impl IntoResponse {
    let (status, body) = generate_inner(&state.app, agent, req).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

async fn dispatch(app: &App, request: WaypointRequest) -> (StatusCode, Value) {
    let response = crate::router::handle_request(request, app).await;
    match response_to_http(response) {
        Ok(data) => (StatusCode::OK, data),
        Err(err) => err,
    }
}

/// HTTP status for a machine-readable error kind.
pub fn status_for_kind(kind: Option<&str>) -> StatusCode {
    match kind {
        Some("run_not_found" | "workflow_not_found" | "agent_not_found" | "thread_not_found") => {
            StatusCode::NOT_FOUND
        }
        Some("invalid_run_state" | "thread_ownership") => StatusCode::CONFLICT,
        Some(
            "input_schema_violation"
            | "resume_schema_violation"
            | "schema_mismatch"
            | "working_memory_policy",
        ) => StatusCode::UNPROCESSABLE_ENTITY,
        Some("budget_unsatisfiable" | "generation_schema_violation" | "model" | "embedding") => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert an IPC `WaypointResponse` into an HTTP body, or an error status and body.
pub fn response_to_http(response: WaypointResponse) -> std::result::Result<Value, (StatusCode, Value)> {
    if response.is_ok() {
        return Ok(response.data.unwrap_or_else(|| json!({})));
    }
    let status = status_for_kind(response.kind.as_deref());
    let mut body = json!({
        "status": "error",
        "error": response.error.unwrap_or_else(|| "unknown error".to_string()),
        "kind": response.kind,
    });
    if let Some(step_id) = response.data.as_ref().and_then(|d| d.get("step_id")) {
        body["step_id"] = step_id.clone();
    }
    Err((status, body))
}
