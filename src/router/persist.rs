//! Write-behind queue for best-effort storage updates.
//!
//! The scheduler enqueues writes while it holds the registry lock and never
//! awaits them. A single writer task applies them in submission order, so
//! the rows for one task always see assignment before release or
//! completion. Failures are logged and dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::router::session::WorkerId;
use crate::store::Database;
use crate::task::{Task, TaskId};

#[derive(Debug)]
pub enum PersistOp {
    Assign { task_id: TaskId, worker_id: WorkerId },
    Release { task_id: TaskId },
    Complete { task: Task, at: DateTime<Utc> },
    Fail { task: Task },
    ReleaseWorker { worker_id: WorkerId, last_seen: DateTime<Utc> },
    Flush(oneshot::Sender<()>),
}

/// Handle for submitting writes.
#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistQueue {
    /// Start the writer. It exits once every handle is dropped.
    pub fn spawn(store: Arc<dyn Database>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
        let handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                apply(store.as_ref(), op).await;
            }
            debug!("Persist queue closed");
        });
        (Self { tx }, handle)
    }

    pub fn submit(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            warn!("Persist queue closed, write dropped");
        }
    }

    /// Wait until every write submitted before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(PersistOp::Flush(done_tx));
        let _ = done_rx.await;
    }
}

async fn apply(store: &dyn Database, op: PersistOp) {
    match op {
        PersistOp::Assign { task_id, worker_id } => {
            if let Err(e) = store.persist_task_assignment(task_id, worker_id).await {
                warn!(task_id, worker_id, error = %e, "Failed to persist task assignment");
            }
        }
        PersistOp::Release { task_id } => {
            if let Err(e) = store.release_task_assignment(task_id).await {
                warn!(task_id, error = %e, "Failed to release task assignment");
            }
        }
        PersistOp::Complete { mut task, at } => {
            if let Err(e) = task.complete(store, at).await {
                warn!(task_id = task.task_id, error = %e, "Failed to persist task completion");
            }
        }
        PersistOp::Fail { mut task } => {
            if let Err(e) = task.fail(store).await {
                warn!(task_id = task.task_id, error = %e, "Failed to persist task failure");
            }
        }
        PersistOp::ReleaseWorker {
            worker_id,
            last_seen,
        } => {
            if let Err(e) = store.release_worker(worker_id, last_seen).await {
                warn!(worker_id, error = %e, "Failed to record worker last-seen");
            }
        }
        PersistOp::Flush(done) => {
            let _ = done.send(());
        }
    }
}
