//! Internal HTTP API: load stats and advisory task cancel.
//!
//! Bound to loopback only; there is no auth on these routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use super::scheduler::{RouterStats, Scheduler};
use crate::task::TaskId;

pub fn internal_routes(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/tasks/{task_id}/cancel", post(cancel_task))
        .route("/health", get(health))
        .with_state(scheduler)
}

async fn stats(State(scheduler): State<Arc<Scheduler>>) -> Json<RouterStats> {
    Json(scheduler.stats().await)
}

/// Advisory: 202 when the holding worker was told, 404 when no worker holds it.
async fn cancel_task(
    State(scheduler): State<Arc<Scheduler>>,
    Path(task_id): Path<TaskId>,
) -> StatusCode {
    if scheduler.request_cancel(task_id).await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
