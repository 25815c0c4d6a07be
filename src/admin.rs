//! Admin REST surface for operators.
//!
//! Thin handlers over a [`WorkerHandle`]: status and health, activity and
//! run history, pause controls, manual trigger, limiter and quota usage,
//! per-user priority analytics and generation hints.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::rejection::{JsonRejection, PathRejection},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::ai::QuestionType;
use crate::worker::coordinator::{PlanError, TriggerAck, WorkerHandle};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;
const STATUS_TRANSITIONS: usize = 10;
const DEFAULT_HINT_TTL_SECS: u64 = 3600;
const MAX_HINT_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

impl ListParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
struct HintRequest {
    question_type: String,
    ttl_secs: Option<u64>,
}

/// Build the Axum router for `/api/worker/*`.
pub fn admin_routes(handle: WorkerHandle) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/api/worker/status", get(get_status))
        .route("/api/worker/health", get(get_health))
        .route("/api/worker/activity", get(list_activity))
        .route("/api/worker/runs", get(list_runs))
        .route("/api/worker/pause", post(pause_global))
        .route("/api/worker/resume", post(resume_global))
        .route("/api/worker/instance/pause", post(pause_instance))
        .route("/api/worker/instance/resume", post(resume_instance))
        .route("/api/worker/users/{id}/pause", post(pause_user))
        .route("/api/worker/users/{id}/resume", post(resume_user))
        .route("/api/worker/users/{id}/priority", get(user_priority))
        .route("/api/worker/users/{id}/hints", post(add_hint))
        .route("/api/worker/trigger", post(trigger))
        .route("/api/worker/concurrency", get(concurrency))
        .route("/api/worker/usage", get(usage))
        .layer(CorsLayer::permissive())
        .with_state(handle)
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({"error": message.to_string()}))).into_response()
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    warn!(error = %e, "{context} failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
}

/// Unwrap a `{id}` path segment or answer 400 in the API's JSON shape.
fn user_id(path: Result<Path<i64>, PathRejection>) -> Result<i64, Response> {
    path.map(|Path(id)| id)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid user id: {}", e.body_text())))
}

// ── Health & status ─────────────────────────────────────────────────────

async fn liveness() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "quizgen-worker"
    }))
}

async fn get_status(State(handle): State<WorkerHandle>) -> Response {
    let state = handle.state().await;
    let transitions = handle.transitions(STATUS_TRANSITIONS).await;
    match handle.status().await {
        Ok(status) => {
            let healthy = match handle.health().await {
                Ok(health) => health
                    .instances
                    .iter()
                    .any(|i| i.status.instance == handle.instance() && i.healthy),
                Err(_) => false,
            };
            Json(serde_json::json!({
                "instance": handle.instance(),
                "state": state,
                "healthy": healthy,
                "status": status,
                "transitions": transitions,
            }))
            .into_response()
        }
        Err(e) => internal_error("status", e),
    }
}

async fn get_health(State(handle): State<WorkerHandle>) -> Response {
    match handle.health().await {
        Ok(health) => Json(health).into_response(),
        Err(e) => internal_error("health", e),
    }
}

async fn list_activity(
    State(handle): State<WorkerHandle>,
    Query(params): Query<ListParams>,
) -> Response {
    match handle.activity(params.limit()).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => internal_error("activity", e),
    }
}

async fn list_runs(State(handle): State<WorkerHandle>, Query(params): Query<ListParams>) -> Response {
    match handle.runs(params.limit()).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => internal_error("runs", e),
    }
}

// ── Pause controls ──────────────────────────────────────────────────────

async fn pause_global(State(handle): State<WorkerHandle>) -> Response {
    match handle.pause().pause_global().await {
        Ok(()) => {
            info!("Global pause requested via admin API");
            Json(serde_json::json!({"status": "paused", "scope": "global"})).into_response()
        }
        Err(e) => internal_error("pause", e),
    }
}

async fn resume_global(State(handle): State<WorkerHandle>) -> Response {
    match handle.pause().resume_global().await {
        Ok(()) => {
            info!("Global resume requested via admin API");
            Json(serde_json::json!({"status": "resumed", "scope": "global"})).into_response()
        }
        Err(e) => internal_error("resume", e),
    }
}

async fn pause_instance(State(handle): State<WorkerHandle>) -> Response {
    match handle.pause().pause_instance().await {
        Ok(()) => Json(serde_json::json!({
            "status": "paused",
            "scope": "instance",
            "instance": handle.instance(),
        }))
        .into_response(),
        Err(e) => internal_error("instance pause", e),
    }
}

async fn resume_instance(State(handle): State<WorkerHandle>) -> Response {
    match handle.pause().resume_instance().await {
        Ok(()) => Json(serde_json::json!({
            "status": "resumed",
            "scope": "instance",
            "instance": handle.instance(),
        }))
        .into_response(),
        Err(e) => internal_error("instance resume", e),
    }
}

async fn pause_user(
    State(handle): State<WorkerHandle>,
    path: Result<Path<i64>, PathRejection>,
) -> Response {
    let user_id = match user_id(path) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match handle.pause().pause_user(user_id).await {
        Ok(()) => Json(serde_json::json!({"status": "paused", "user_id": user_id})).into_response(),
        Err(e) => internal_error("user pause", e),
    }
}

async fn resume_user(
    State(handle): State<WorkerHandle>,
    path: Result<Path<i64>, PathRejection>,
) -> Response {
    let user_id = match user_id(path) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match handle.pause().resume_user(user_id).await {
        Ok(()) => {
            Json(serde_json::json!({"status": "resumed", "user_id": user_id})).into_response()
        }
        Err(e) => internal_error("user resume", e),
    }
}

// ── Trigger & analytics ─────────────────────────────────────────────────

async fn trigger(State(handle): State<WorkerHandle>) -> Response {
    let ack = handle.trigger_now().await;
    let status = match ack {
        TriggerAck::Accepted => StatusCode::ACCEPTED,
        TriggerAck::Coalesced => StatusCode::OK,
        TriggerAck::Rejected => StatusCode::CONFLICT,
    };
    (status, Json(serde_json::json!({"result": ack}))).into_response()
}

async fn concurrency(State(handle): State<WorkerHandle>) -> impl IntoResponse {
    Json(handle.concurrency())
}

async fn usage(State(handle): State<WorkerHandle>) -> Response {
    match handle.usage().await {
        Ok(usage) => Json(usage).into_response(),
        Err(e) => internal_error("usage", e),
    }
}

async fn user_priority(
    State(handle): State<WorkerHandle>,
    path: Result<Path<i64>, PathRejection>,
) -> Response {
    let user_id = match user_id(path) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match handle.user_priority(user_id).await {
        Ok(report) => Json(serde_json::json!({
            "generated_at": Utc::now(),
            "report": report,
        }))
        .into_response(),
        Err(e @ PlanError::UnknownUser(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e @ PlanError::InvalidProvider(_)) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, e)
        }
        Err(e @ PlanError::Database(_)) => internal_error("priority", e),
    }
}

async fn add_hint(
    State(handle): State<WorkerHandle>,
    path: Result<Path<i64>, PathRejection>,
    body: Result<Json<HintRequest>, JsonRejection>,
) -> Response {
    let user_id = match user_id(path) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let request = match body {
        Ok(Json(request)) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let question_type: QuestionType = match request.question_type.parse() {
        Ok(qt) => qt,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let ttl_secs = request
        .ttl_secs
        .unwrap_or(DEFAULT_HINT_TTL_SECS)
        .clamp(1, MAX_HINT_TTL_SECS);
    let ttl = Duration::from_secs(ttl_secs);
    match handle.add_hint(user_id, question_type, ttl).await {
        Ok(expires_at) => Json(serde_json::json!({
            "user_id": user_id,
            "question_type": question_type,
            "expires_at": expires_at,
        }))
        .into_response(),
        Err(e) => internal_error("hint", e),
    }
}
