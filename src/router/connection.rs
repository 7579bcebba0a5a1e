//! Per-socket connection actor.
//!
//! One task per websocket. It owns the socket and drives the session state
//! machine: handshake, heartbeat, task reports, drain and final cleanup. All
//! shared state is reached through the scheduler.

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::interval_at;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::router::protocol::WsMessage;
use crate::router::scheduler::TaskOutcome;
use crate::router::session::{SessionState, WorkerId};
use crate::router::ws::RouterState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct Connection {
    conn_id: Uuid,
    state: SessionState,
    worker_id: Option<WorkerId>,
    alive: bool,
    /// Set when the router sent DW_RESET; cleanup then hands tasks back
    /// to the backlog instead of failing them.
    reset: bool,
    drain_started: Option<Instant>,
    outbound: mpsc::UnboundedSender<WsMessage>,
    router: RouterState,
}

/// Serve one worker socket until it closes.
pub async fn handle_socket(mut socket: WebSocket, router: RouterState) {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut shutdown = router.shutdown.clone();
    let period = router.heartbeat_interval;
    let mut heartbeat = interval_at(tokio::time::Instant::now() + period, period);

    let mut conn = Connection {
        conn_id: Uuid::new_v4(),
        state: SessionState::Connecting,
        worker_id: None,
        alive: true,
        reset: false,
        drain_started: None,
        outbound,
        router,
    };
    info!(conn_id = %conn.conn_id, "Worker socket connected");

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if conn.on_heartbeat().await == Flow::Close {
                    break;
                }
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!(conn_id = %conn.conn_id, "Ping failed, client gone");
                    break;
                }
            }

            Some(msg) = outbound_rx.recv() => {
                if socket.send(Message::Text(msg.encode().into())).await.is_err() {
                    debug!(conn_id = %conn.conn_id, "Send failed, client gone");
                    break;
                }
            }

            _ = shutdown.changed() => {
                info!(conn_id = %conn.conn_id, worker_id = ?conn.worker_id, "Router shutting down, resetting worker");
                let _ = conn.outbound.send(WsMessage::Reset);
                conn.reset = true;
                break;
            }

            result = socket.recv() => {
                let flow = match result {
                    Some(Ok(Message::Text(text))) => conn.on_frame(WsMessage::decode(text.as_str())).await,
                    Some(Ok(Message::Binary(bytes))) => conn.on_frame(WsMessage::decode_bytes(&bytes)).await,
                    Some(Ok(Message::Pong(_))) => {
                        conn.alive = true;
                        Flow::Continue
                    }
                    Some(Ok(Message::Ping(_))) => Flow::Continue,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(conn_id = %conn.conn_id, worker_id = ?conn.worker_id, "Worker socket closed");
                        Flow::Close
                    }
                    Some(Err(e)) => {
                        warn!(conn_id = %conn.conn_id, error = %e, "Worker socket error");
                        Flow::Close
                    }
                };
                if flow == Flow::Close {
                    break;
                }
            }
        }
    }

    // Deliver anything queued before closing (rejections, DW_RESET).
    while let Ok(msg) = outbound_rx.try_recv() {
        if socket.send(Message::Text(msg.encode().into())).await.is_err() {
            break;
        }
    }
    let _ = socket.send(Message::Close(None)).await;

    conn.close().await;
}

impl Connection {
    async fn on_frame(&mut self, decoded: Result<WsMessage, ProtocolError>) -> Flow {
        match decoded {
            Ok(msg) => self.on_message(msg).await,
            Err(e) => {
                warn!(conn_id = %self.conn_id, worker_id = ?self.worker_id, error = %e, "Discarding malformed frame");
                Flow::Continue
            }
        }
    }

    async fn on_message(&mut self, msg: WsMessage) -> Flow {
        match msg {
            WsMessage::Auth { token, worker_id } => self.on_auth(&token, worker_id).await,
            other => {
                let Some(worker_id) = self.worker_id.filter(|_| self.state.is_admitted()) else {
                    warn!(conn_id = %self.conn_id, kind = other.kind().name(), "Message before AUTH, ignoring");
                    return Flow::Continue;
                };
                self.on_worker_message(worker_id, other).await
            }
        }
    }

    async fn on_worker_message(&mut self, worker_id: WorkerId, msg: WsMessage) -> Flow {
        let scheduler = &self.router.scheduler;
        match msg {
            WsMessage::ClearQueue => {
                if self.state == SessionState::Active {
                    scheduler.drain(worker_id).await;
                    self.state = SessionState::Draining;
                    self.drain_started = Some(Instant::now());
                }
                self.drained_flow(worker_id).await
            }
            WsMessage::TaskStart { task_id } => {
                scheduler.task_started(worker_id, task_id).await;
                Flow::Continue
            }
            WsMessage::TaskDone { task_id } => {
                scheduler
                    .complete_task(worker_id, task_id, TaskOutcome::Done)
                    .await;
                self.drained_flow(worker_id).await
            }
            WsMessage::TaskFail { task_id } => {
                scheduler
                    .complete_task(worker_id, task_id, TaskOutcome::Failed)
                    .await;
                self.drained_flow(worker_id).await
            }
            other => {
                warn!(
                    conn_id = %self.conn_id,
                    worker_id,
                    kind = other.kind().name(),
                    "Router-bound socket received a router-to-worker message"
                );
                Flow::Continue
            }
        }
    }

    /// A draining worker that holds nothing more is done.
    async fn drained_flow(&self, worker_id: WorkerId) -> Flow {
        if self.state != SessionState::Draining {
            return Flow::Continue;
        }
        match self.router.scheduler.assigned_count(worker_id).await {
            Some(0) | None => {
                info!(conn_id = %self.conn_id, worker_id, "Drain complete, closing");
                Flow::Close
            }
            Some(_) => Flow::Continue,
        }
    }

    async fn on_auth(&mut self, token: &str, worker_id: WorkerId) -> Flow {
        if self.state != SessionState::Connecting {
            warn!(conn_id = %self.conn_id, worker_id, state = ?self.state, "Repeated AUTH, ignoring");
            return Flow::Continue;
        }
        self.state = SessionState::Authenticating;

        let user_id = match self.router.auth.authenticate(token).await {
            Ok(user_id) => user_id,
            Err(e) => {
                info!(conn_id = %self.conn_id, worker_id, error = %e, "Rejected auth token");
                return self.reject(WsMessage::BadAuthToken);
            }
        };

        let store = &self.router.store;
        let registration = match store.claim_worker(worker_id, user_id, Utc::now()).await {
            Ok(Some(registration)) => registration,
            Ok(None) => {
                info!(conn_id = %self.conn_id, worker_id, user_id, "Worker id unknown or already claimed");
                return self.reject(WsMessage::BadWorkerId);
            }
            Err(e) => {
                warn!(conn_id = %self.conn_id, worker_id, error = %e, "Worker claim failed");
                return self.reject(WsMessage::BadWorkerId);
            }
        };

        if let Err(e) = self
            .router
            .scheduler
            .admit(registration, self.outbound.clone())
            .await
        {
            warn!(conn_id = %self.conn_id, worker_id, error = %e, "Worker not admitted");
            if let Err(e) = store.release_worker(worker_id, Utc::now()).await {
                warn!(worker_id, error = %e, "Failed to release worker claim");
            }
            return self.reject(WsMessage::BadWorkerId);
        }

        // The scheduler queued the AUTH acknowledgement on admission.
        self.worker_id = Some(worker_id);
        self.state = SessionState::Active;
        info!(conn_id = %self.conn_id, worker_id, user_id, "Worker authenticated");
        Flow::Continue
    }

    fn reject(&mut self, msg: WsMessage) -> Flow {
        let _ = self.outbound.send(msg);
        self.state = SessionState::Closed;
        Flow::Close
    }

    async fn on_heartbeat(&mut self) -> Flow {
        if !self.alive {
            warn!(conn_id = %self.conn_id, worker_id = ?self.worker_id, "Heartbeat missed, terminating");
            return Flow::Close;
        }

        if let (SessionState::Draining, Some(worker_id)) = (self.state, self.worker_id) {
            if self.drained_flow(worker_id).await == Flow::Close {
                return Flow::Close;
            }
            let timed_out = self
                .drain_started
                .is_some_and(|started| started.elapsed() >= self.router.drain_timeout);
            if timed_out {
                warn!(conn_id = %self.conn_id, worker_id, "Drain timeout, closing");
                return Flow::Close;
            }
        }

        self.alive = false;
        Flow::Continue
    }

    /// Runs once, after the socket loop ends.
    async fn close(&mut self) {
        self.state = SessionState::Closed;
        if let Some(worker_id) = self.worker_id.take() {
            if self.reset {
                self.router.scheduler.detach(worker_id).await;
            } else {
                self.router.scheduler.disconnect(worker_id).await;
            }
        }
        info!(conn_id = %self.conn_id, "Worker connection closed");
    }
}
