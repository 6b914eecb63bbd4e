//! API route handlers for the admin gateway.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use warden_core::WardenError;

use super::server::AppState;

const MAX_PREVIEW: usize = 50;

/// JSON error body: `{"ok": false, "error": ..., "kind": ...}`.
pub fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"ok": false, "error": message, "kind": kind})),
    )
        .into_response()
}

/// Scheduler error rendered as an HTTP response.
pub struct ApiError(WardenError);

impl From<WardenError> for ApiError {
    fn from(e: WardenError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WardenError::InvalidSchedule(_) | WardenError::Config(_) => StatusCode::BAD_REQUEST,
            WardenError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            WardenError::AlreadyRunning(_) | WardenError::LeaseContention(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("admin request failed: {}", self.0);
        }
        error_response(status, self.0.kind(), &self.0.to_string())
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

/// Liveness probe (public).
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let engine = state.admin.engine();
    Json(serde_json::json!({
        "status": "ok",
        "holder": engine.holder_id(),
        "tasks": engine.registry().len(),
        "running": engine.running_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// List all registered tasks with their state.
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> ApiResult {
    let tasks = state.admin.list_tasks()?;
    Ok(Json(serde_json::json!({"ok": true, "count": tasks.len(), "tasks": tasks})))
}

pub async fn get_task(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    let task = state.admin.get_task(&name)?;
    Ok(Json(serde_json::json!({"ok": true, "task": task})))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Newest-first run history.
pub async fn task_history(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let limit = query
        .limit
        .unwrap_or(warden_scheduler::admin::DEFAULT_HISTORY_PAGE);
    let runs = state.admin.get_history(&name, limit)?;
    Ok(Json(serde_json::json!({"ok": true, "task": name, "count": runs.len(), "runs": runs})))
}

pub async fn enable_task(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    let changed = state.admin.enable(&name)?;
    Ok(Json(serde_json::json!({"ok": true, "task": name, "enabled": true, "changed": changed})))
}

pub async fn disable_task(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    let changed = state.admin.disable(&name)?;
    Ok(Json(serde_json::json!({"ok": true, "task": name, "enabled": false, "changed": changed})))
}

/// Start a run now. Responds once the run is dispatched, not when it ends.
pub async fn trigger_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let _handle = state.admin.trigger(&name)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"ok": true, "task": name, "triggered": true})),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleBody {
    pub schedule: String,
    #[serde(default)]
    pub count: Option<usize>,
}

/// Replace a task's effective schedule.
pub async fn set_schedule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<ScheduleBody>,
) -> ApiResult {
    let task = state.admin.update_schedule(&name, &body.schedule)?;
    Ok(Json(serde_json::json!({"ok": true, "task": task})))
}

/// Validate an expression and preview upcoming occurrences.
pub async fn validate_schedule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleBody>,
) -> ApiResult {
    let count = body.count.unwrap_or(5).clamp(1, MAX_PREVIEW);
    let next = state.admin.preview_schedule(&body.schedule, count)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "valid": true,
        "schedule": body.schedule,
        "timezone": state.admin.engine().config().timezone.name(),
        "next": next,
    })))
}
