//! WebSocket endpoint for workers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{State, ws::WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio::sync::watch;
use tracing::debug;

use super::connection::handle_socket;
use super::scheduler::Scheduler;
use crate::auth::AuthGate;
use crate::store::Database;

/// State shared by every worker connection.
#[derive(Clone)]
pub struct RouterState {
    pub scheduler: Arc<Scheduler>,
    pub auth: Arc<dyn AuthGate>,
    pub store: Arc<dyn Database>,
    pub heartbeat_interval: Duration,
    /// How long a draining worker may keep started tasks.
    pub drain_timeout: Duration,
    /// Flips to `true` when the router is going down.
    pub shutdown: watch::Receiver<bool>,
}

/// Build the Axum router with the worker websocket route.
pub fn worker_routes(state: RouterState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "dispatch-router"
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RouterState>) -> impl IntoResponse {
    debug!("Worker connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
