//! `Database` trait — the router's view of durable storage.
//!
//! The router treats storage as a FIFO backlog of pending tasks, a sink for
//! lifecycle updates, and a lookup for tokens and worker registrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::router::session::WorkerId;
use crate::task::{Task, TaskId, UserId};

/// A persisted bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokenRecord {
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

impl AuthTokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Capacity and policy declared when a worker enlisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerRegistration {
    pub worker_id: WorkerId,
    pub user_id: UserId,
    pub threads: u32,
    pub accept_foreign_work: bool,
}

/// Counts of rows touched by startup recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub released_claims: u64,
    pub released_tasks: u64,
}

/// Backend-agnostic storage trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create or migrate the schema.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Auth ────────────────────────────────────────────────────────

    /// Look up a raw token (no `Bearer ` prefix).
    async fn find_auth_token(&self, token: &str)
    -> Result<Option<AuthTokenRecord>, DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Claim a worker registration for a live connection.
    ///
    /// Returns `None` when the registration does not exist, belongs to another
    /// user, or is already claimed. Claiming sets `connect_ts`.
    async fn claim_worker(
        &self,
        worker_id: WorkerId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerRegistration>, DatabaseError>;

    /// Record `last_seen_ts` and clear the claim so the worker may reconnect.
    async fn release_worker(
        &self,
        worker_id: WorkerId,
        last_seen: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Unassigned, unfinished, non-failed tasks, oldest first.
    async fn fetch_pending_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    async fn persist_task_assignment(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
    ) -> Result<(), DatabaseError>;

    /// Put a task back into the backlog.
    async fn release_task_assignment(&self, task_id: TaskId) -> Result<(), DatabaseError>;

    async fn persist_task_done(
        &self,
        task_id: TaskId,
        start_ts: Option<DateTime<Utc>>,
        end_ts: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn persist_task_failed(
        &self,
        task_id: TaskId,
        start_ts: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Clear state left behind by a previous router process: worker claims
    /// and assignments of tasks that never finished.
    async fn recover_stale_state(&self) -> Result<RecoveryReport, DatabaseError>;
}
