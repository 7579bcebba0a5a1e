//! In-memory `Database` implementation.
//!
//! Keeps every row in process memory and records each write in a log so
//! tests can assert on exactly what the router persisted. Reads and writes
//! can be made to fail on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::router::session::WorkerId;
use crate::store::traits::{AuthTokenRecord, Database, RecoveryReport, WorkerRegistration};
use crate::store::{StoredTask, StoredWorker};
use crate::task::{Task, TaskId, UserId};

/// One persisted mutation, in the order it was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Assigned { task_id: TaskId, worker_id: WorkerId },
    Released { task_id: TaskId },
    Done { task_id: TaskId },
    Failed { task_id: TaskId },
    WorkerClaimed { worker_id: WorkerId },
    WorkerReleased { worker_id: WorkerId },
}

#[derive(Default)]
struct MemoryState {
    tokens: HashMap<String, AuthTokenRecord>,
    workers: BTreeMap<WorkerId, StoredWorker>,
    tasks: BTreeMap<TaskId, StoredTask>,
    writes: Vec<StoreWrite>,
    next_worker_id: WorkerId,
    next_task_id: TaskId,
    fail_reads: bool,
    fail_writes: bool,
}

/// Pure in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_read(state: &MemoryState, op: &str) -> Result<(), DatabaseError> {
        if state.fail_reads {
            return Err(DatabaseError::Query(format!("{op}: injected read failure")));
        }
        Ok(())
    }

    fn check_write(state: &MemoryState, op: &str) -> Result<(), DatabaseError> {
        if state.fail_writes {
            return Err(DatabaseError::Query(format!("{op}: injected write failure")));
        }
        Ok(())
    }

    // ── Fixtures ────────────────────────────────────────────────────

    pub fn insert_auth_token(&self, token: &str, user_id: UserId, expires_at: DateTime<Utc>) {
        self.state().tokens.insert(
            token.to_string(),
            AuthTokenRecord {
                user_id,
                expires_at,
            },
        );
    }

    /// Enlist a worker. Returns the new worker id.
    pub fn register_worker(&self, user_id: UserId, threads: u32, accept_foreign_work: bool) -> WorkerId {
        let mut state = self.state();
        state.next_worker_id += 1;
        let worker_id = state.next_worker_id;
        state.workers.insert(
            worker_id,
            StoredWorker {
                registration: WorkerRegistration {
                    worker_id,
                    user_id,
                    threads,
                    accept_foreign_work,
                },
                connect_ts: None,
                last_seen_ts: None,
            },
        );
        worker_id
    }

    /// Insert a pending task. A zero `task_id` gets the next free id.
    pub fn insert_task(&self, mut task: Task) -> TaskId {
        let mut state = self.state();
        if task.task_id == 0 {
            state.next_task_id += 1;
            task.task_id = state.next_task_id;
        } else {
            state.next_task_id = state.next_task_id.max(task.task_id);
        }
        let task_id = task.task_id;
        state.tasks.insert(
            task_id,
            StoredTask {
                task,
                worker_id: None,
            },
        );
        task_id
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<StoredTask> {
        self.state().tasks.get(&task_id).cloned()
    }

    pub fn get_worker(&self, worker_id: WorkerId) -> Option<StoredWorker> {
        self.state().workers.get(&worker_id).cloned()
    }

    // ── Inspection and failure injection ────────────────────────────

    pub fn writes(&self) -> Vec<StoreWrite> {
        self.state().writes.clone()
    }

    pub fn done_writes(&self, task_id: TaskId) -> usize {
        self.count_writes(|w| *w == StoreWrite::Done { task_id })
    }

    pub fn failed_writes(&self, task_id: TaskId) -> usize {
        self.count_writes(|w| *w == StoreWrite::Failed { task_id })
    }

    pub fn assignment_writes(&self, task_id: TaskId) -> usize {
        self.count_writes(|w| matches!(w, StoreWrite::Assigned { task_id: t, .. } if *t == task_id))
    }

    fn count_writes(&self, pred: impl Fn(&StoreWrite) -> bool) -> usize {
        self.state().writes.iter().filter(|w| pred(w)).count()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn find_auth_token(
        &self,
        token: &str,
    ) -> Result<Option<AuthTokenRecord>, DatabaseError> {
        let state = self.state();
        Self::check_read(&state, "find_auth_token")?;
        Ok(state.tokens.get(token).cloned())
    }

    async fn claim_worker(
        &self,
        worker_id: WorkerId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerRegistration>, DatabaseError> {
        let mut state = self.state();
        Self::check_write(&state, "claim_worker")?;
        let claimed = match state.workers.get_mut(&worker_id) {
            Some(row) if row.registration.user_id == user_id && row.connect_ts.is_none() => {
                row.connect_ts = Some(now);
                Some(row.registration)
            }
            _ => None,
        };
        if claimed.is_some() {
            state.writes.push(StoreWrite::WorkerClaimed { worker_id });
        }
        Ok(claimed)
    }

    async fn release_worker(
        &self,
        worker_id: WorkerId,
        last_seen: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state();
        Self::check_write(&state, "release_worker")?;
        if let Some(row) = state.workers.get_mut(&worker_id) {
            row.connect_ts = None;
            row.last_seen_ts = Some(last_seen);
        }
        state.writes.push(StoreWrite::WorkerReleased { worker_id });
        Ok(())
    }

    async fn fetch_pending_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let state = self.state();
        Self::check_read(&state, "fetch_pending_tasks")?;
        let mut pending: Vec<Task> = state
            .tasks
            .values()
            .filter(|row| row.worker_id.is_none() && !row.task.failed && row.task.end_ts.is_none())
            .map(|row| row.task.clone())
            .collect();
        pending.sort_by(|a, b| {
            a.arrive_ts
                .cmp(&b.arrive_ts)
                .then(a.task_id.cmp(&b.task_id))
        });
        Ok(pending)
    }

    async fn persist_task_assignment(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state();
        Self::check_write(&state, "persist_task_assignment")?;
        if let Some(row) = state.tasks.get_mut(&task_id) {
            row.worker_id = Some(worker_id);
        }
        state.writes.push(StoreWrite::Assigned { task_id, worker_id });
        Ok(())
    }

    async fn release_task_assignment(&self, task_id: TaskId) -> Result<(), DatabaseError> {
        let mut state = self.state();
        Self::check_write(&state, "release_task_assignment")?;
        if let Some(row) = state.tasks.get_mut(&task_id) {
            row.worker_id = None;
            row.task.start_ts = None;
        }
        state.writes.push(StoreWrite::Released { task_id });
        Ok(())
    }

    async fn persist_task_done(
        &self,
        task_id: TaskId,
        start_ts: Option<DateTime<Utc>>,
        end_ts: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state();
        Self::check_write(&state, "persist_task_done")?;
        if let Some(row) = state.tasks.get_mut(&task_id) {
            row.task.start_ts = start_ts;
            row.task.end_ts = Some(end_ts);
            row.task.failed = false;
        }
        state.writes.push(StoreWrite::Done { task_id });
        Ok(())
    }

    async fn persist_task_failed(
        &self,
        task_id: TaskId,
        start_ts: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state();
        Self::check_write(&state, "persist_task_failed")?;
        if let Some(row) = state.tasks.get_mut(&task_id) {
            row.task.start_ts = start_ts;
            row.task.failed = true;
        }
        state.writes.push(StoreWrite::Failed { task_id });
        Ok(())
    }

    async fn recover_stale_state(&self) -> Result<RecoveryReport, DatabaseError> {
        let mut state = self.state();
        Self::check_write(&state, "recover_stale_state")?;
        let mut report = RecoveryReport::default();
        for row in state.workers.values_mut() {
            if row.connect_ts.take().is_some() {
                report.released_claims += 1;
            }
        }
        for row in state.tasks.values_mut() {
            if row.worker_id.is_some() && row.task.end_ts.is_none() && !row.task.failed {
                row.worker_id = None;
                row.task.start_ts = None;
                report.released_tasks += 1;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let worker_id = store.register_worker(5, 2, false);

        assert!(store.claim_worker(worker_id, 5, Utc::now()).await.unwrap().is_some());
        assert!(store.claim_worker(worker_id, 5, Utc::now()).await.unwrap().is_none());

        store.release_worker(worker_id, Utc::now()).await.unwrap();
        assert!(store.claim_worker(worker_id, 5, Utc::now()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_excludes_assigned_and_failed() {
        let store = MemoryStore::new();
        let t1 = store.insert_task(Task::new(0, "fnA", 5, "a"));
        let t2 = store.insert_task(Task::new(0, "fnA", 5, "b"));
        let t3 = store.insert_task(Task::new(0, "fnA", 5, "c"));

        store.persist_task_assignment(t1, 1).await.unwrap();
        store.persist_task_failed(t2, None).await.unwrap();

        let pending = store.fetch_pending_tasks().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, t3);
    }

    #[tokio::test]
    async fn injected_read_failure() {
        let store = MemoryStore::new();
        store.set_fail_reads(true);
        assert!(store.fetch_pending_tasks().await.is_err());
        store.set_fail_reads(false);
        assert!(store.fetch_pending_tasks().await.is_ok());
    }

    #[tokio::test]
    async fn write_log_records_order() {
        let store = MemoryStore::new();
        let task_id = store.insert_task(Task::new(0, "fnA", 5, "{}"));
        store.persist_task_assignment(task_id, 3).await.unwrap();
        store.persist_task_done(task_id, None, Utc::now()).await.unwrap();

        assert_eq!(
            store.writes(),
            vec![
                StoreWrite::Assigned { task_id, worker_id: 3 },
                StoreWrite::Done { task_id },
            ]
        );
    }
}
