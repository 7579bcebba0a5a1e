//! Persistence layer — the router's storage collaborator.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

use chrono::{DateTime, Utc};

use crate::router::session::WorkerId;
use crate::task::Task;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{AuthTokenRecord, Database, RecoveryReport, WorkerRegistration};

/// A task row together with its persisted assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTask {
    pub task: Task,
    pub worker_id: Option<WorkerId>,
}

/// A worker row including its claim and liveness columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWorker {
    pub registration: WorkerRegistration,
    pub connect_ts: Option<DateTime<Utc>>,
    pub last_seen_ts: Option<DateTime<Utc>>,
}
