//! Dispatch Registry — admitted sessions and their routing pools.
//!
//! Sessions live in one map keyed by worker id. The pools only hold ids:
//! the public pool has every session that accepts foreign work, and each
//! owner's private pool has all of that owner's sessions. A draining session
//! stays in the map (it still reports completions) but leaves every pool.

use std::collections::{BTreeSet, HashMap};

use crate::error::AdmitError;
use crate::router::session::{WorkerId, WorkerSession};
use crate::task::{Task, TaskId, UserId};

#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<WorkerId, WorkerSession>,
    public: BTreeSet<WorkerId>,
    private: HashMap<UserId, BTreeSet<WorkerId>>,
    /// Every task currently held by some session.
    in_flight: HashMap<TaskId, WorkerId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, session: WorkerSession) -> Result<(), AdmitError> {
        let worker_id = session.worker_id;
        if self.sessions.contains_key(&worker_id) {
            return Err(AdmitError::Duplicate(worker_id));
        }
        if session.threads == 0 {
            return Err(AdmitError::NoThreads(worker_id));
        }

        if session.accept_foreign_work {
            self.public.insert(worker_id);
        }
        self.private
            .entry(session.user_id)
            .or_default()
            .insert(worker_id);
        self.sessions.insert(worker_id, session);
        Ok(())
    }

    /// Take a session out of the pools but keep it registered.
    pub fn withdraw(&mut self, worker_id: WorkerId) {
        self.public.remove(&worker_id);
        if let Some(user_id) = self.sessions.get(&worker_id).map(|s| s.user_id) {
            self.remove_private(user_id, worker_id);
        }
    }

    /// Remove a session entirely. Safe to call more than once.
    pub fn remove(&mut self, worker_id: WorkerId) -> Option<WorkerSession> {
        self.withdraw(worker_id);
        let session = self.sessions.remove(&worker_id)?;
        self.in_flight.retain(|_, holder| *holder != worker_id);
        Some(session)
    }

    fn remove_private(&mut self, user_id: UserId, worker_id: WorkerId) {
        if let Some(pool) = self.private.get_mut(&user_id) {
            pool.remove(&worker_id);
            if pool.is_empty() {
                self.private.remove(&user_id);
            }
        }
    }

    /// Candidate workers for a task, ordered by worker id.
    ///
    /// Owner's own sessions always qualify. Other users' sessions qualify
    /// only when the task allows foreign workers and they accept foreign work.
    pub fn eligible_workers_for(&self, task: &Task) -> Vec<WorkerId> {
        let own = self.private.get(&task.owner_user_id);
        let mut candidates: BTreeSet<WorkerId> = own.cloned().unwrap_or_default();
        if task.allow_foreign_workers {
            candidates.extend(self.public.iter().copied());
        }
        candidates.into_iter().collect()
    }

    pub fn session(&self, worker_id: WorkerId) -> Option<&WorkerSession> {
        self.sessions.get(&worker_id)
    }

    pub fn session_mut(&mut self, worker_id: WorkerId) -> Option<&mut WorkerSession> {
        self.sessions.get_mut(&worker_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &WorkerSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn holder_of(&self, task_id: TaskId) -> Option<WorkerId> {
        self.in_flight.get(&task_id).copied()
    }

    pub fn record_assignment(&mut self, task_id: TaskId, worker_id: WorkerId) {
        self.in_flight.insert(task_id, worker_id);
    }

    pub fn clear_assignment(&mut self, task_id: TaskId) {
        self.in_flight.remove(&task_id);
    }

    pub fn is_pooled(&self, worker_id: WorkerId) -> bool {
        self.public.contains(&worker_id)
            || self.private.values().any(|pool| pool.contains(&worker_id))
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::store::WorkerRegistration;

    fn session(worker_id: WorkerId, user_id: UserId, foreign: bool) -> WorkerSession {
        let (tx, _rx) = mpsc::unbounded_channel();
        WorkerSession::new(
            WorkerRegistration {
                worker_id,
                user_id,
                threads: 1,
                accept_foreign_work: foreign,
            },
            tx,
        )
    }

    #[test]
    fn private_worker_only_serves_owner() {
        let mut reg = Registry::new();
        reg.admit(session(1, 7, false)).unwrap();

        let foreign_task = Task::new(1, "f", 5, "").with_foreign_workers(true);
        assert!(reg.eligible_workers_for(&foreign_task).is_empty());

        let own_task = Task::new(2, "f", 7, "");
        assert_eq!(reg.eligible_workers_for(&own_task), vec![1]);
    }

    #[test]
    fn public_worker_serves_foreign_tasks_only_when_allowed() {
        let mut reg = Registry::new();
        reg.admit(session(1, 7, true)).unwrap();

        let closed = Task::new(1, "f", 5, "");
        assert!(reg.eligible_workers_for(&closed).is_empty());

        let open = Task::new(2, "f", 5, "").with_foreign_workers(true);
        assert_eq!(reg.eligible_workers_for(&open), vec![1]);
    }

    #[test]
    fn owner_workers_join_foreign_candidates() {
        let mut reg = Registry::new();
        reg.admit(session(3, 5, false)).unwrap();
        reg.admit(session(1, 7, true)).unwrap();
        reg.admit(session(2, 5, true)).unwrap();

        let task = Task::new(1, "f", 5, "").with_foreign_workers(true);
        assert_eq!(reg.eligible_workers_for(&task), vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_and_zero_thread_sessions_are_refused() {
        let mut reg = Registry::new();
        reg.admit(session(1, 5, true)).unwrap();
        assert_eq!(reg.admit(session(1, 5, true)), Err(AdmitError::Duplicate(1)));

        let (tx, _rx) = mpsc::unbounded_channel();
        let idle = WorkerSession::new(
            WorkerRegistration {
                worker_id: 2,
                user_id: 5,
                threads: 0,
                accept_foreign_work: true,
            },
            tx,
        );
        assert_eq!(reg.admit(idle), Err(AdmitError::NoThreads(2)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = Registry::new();
        reg.admit(session(1, 5, true)).unwrap();
        reg.record_assignment(10, 1);

        assert!(reg.remove(1).is_some());
        assert!(reg.remove(1).is_none());
        assert!(!reg.is_pooled(1));
        assert!(reg.holder_of(10).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn withdrawn_session_stays_registered() {
        let mut reg = Registry::new();
        reg.admit(session(1, 5, true)).unwrap();
        reg.withdraw(1);

        assert!(reg.session(1).is_some());
        assert!(!reg.is_pooled(1));
        let task = Task::new(1, "f", 5, "").with_foreign_workers(true);
        assert!(reg.eligible_workers_for(&task).is_empty());
    }
}
