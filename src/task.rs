//! Task record — one unit of user-submitted work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::store::Database;

/// Store-assigned task identifier.
pub type TaskId = i64;

/// Identifier of a user (task owner or worker owner).
pub type UserId = i64;

/// Lifecycle status derived from a task's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started yet.
    Pending,
    /// A worker reported it started.
    InFlight,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

/// A task as read from the backlog.
///
/// Identity and policy are fixed at creation; only the lifecycle fields
/// change while a worker holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub function_id: String,
    pub owner_user_id: UserId,
    /// Passed to the worker untouched.
    pub additional_data: String,
    /// May run on workers not owned by `owner_user_id`.
    pub allow_foreign_workers: bool,
    /// Prefer workers that have not run this function yet.
    pub prevent_reuse: bool,
    pub arrive_ts: DateTime<Utc>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub failed: bool,
}

impl Task {
    /// Create a fresh pending task with default routing policy.
    pub fn new(
        task_id: TaskId,
        function_id: impl Into<String>,
        owner_user_id: UserId,
        additional_data: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            function_id: function_id.into(),
            owner_user_id,
            additional_data: additional_data.into(),
            allow_foreign_workers: false,
            prevent_reuse: false,
            arrive_ts: Utc::now(),
            start_ts: None,
            end_ts: None,
            failed: false,
        }
    }

    pub fn with_foreign_workers(mut self, allow: bool) -> Self {
        self.allow_foreign_workers = allow;
        self
    }

    pub fn with_prevent_reuse(mut self, prevent: bool) -> Self {
        self.prevent_reuse = prevent;
        self
    }

    /// Current lifecycle status.
    pub fn status(&self) -> TaskStatus {
        if self.failed {
            TaskStatus::Failed
        } else if self.end_ts.is_some() {
            TaskStatus::Completed
        } else if self.start_ts.is_some() {
            TaskStatus::InFlight
        } else {
            TaskStatus::Pending
        }
    }

    /// Record that the worker began executing.
    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.start_ts = Some(at);
    }

    /// Record a successful finish and persist it.
    pub async fn complete(
        &mut self,
        store: &dyn Database,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.end_ts = Some(at);
        self.failed = false;
        store
            .persist_task_done(self.task_id, self.start_ts, at)
            .await
    }

    /// Record a failure and persist it.
    pub async fn fail(&mut self, store: &dyn Database) -> Result<(), DatabaseError> {
        self.failed = true;
        store.persist_task_failed(self.task_id, self.start_ts).await
    }
}
