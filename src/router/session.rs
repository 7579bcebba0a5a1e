//! Worker session — router-side state for one authenticated connection.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::router::protocol::WsMessage;
use crate::store::WorkerRegistration;
use crate::task::{Task, TaskId, UserId};

/// Identifier assigned by the worker registration API.
pub type WorkerId = i64;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, no AUTH yet.
    Connecting,
    /// AUTH received, token and registration being checked.
    Authenticating,
    /// Receives tasks.
    Active,
    /// Asked to leave; keeps its started tasks, gets nothing new.
    Draining,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Admitted to the registry (tasks may be held).
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Active | Self::Draining)
    }
}

/// Registry-owned runtime state of a worker.
///
/// The connection actor owns the socket; the session only holds the sending
/// half of its outbound queue, so the scheduler can hand off a task without
/// touching the socket.
#[derive(Debug)]
pub struct WorkerSession {
    pub worker_id: WorkerId,
    pub user_id: UserId,
    pub threads: u32,
    pub accept_foreign_work: bool,
    assigned: BTreeMap<TaskId, Task>,
    known_functions: HashSet<String>,
    draining: bool,
    outbound: mpsc::UnboundedSender<WsMessage>,
}

impl WorkerSession {
    pub fn new(registration: WorkerRegistration, outbound: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self {
            worker_id: registration.worker_id,
            user_id: registration.user_id,
            threads: registration.threads,
            accept_foreign_work: registration.accept_foreign_work,
            assigned: BTreeMap::new(),
            known_functions: HashSet::new(),
            draining: false,
            outbound,
        }
    }

    /// Assigned tasks per declared thread.
    pub fn jobs_per_proc(&self) -> f64 {
        self.assigned.len() as f64 / f64::from(self.threads.max(1))
    }

    pub fn knows_function(&self, function_id: &str) -> bool {
        self.known_functions.contains(function_id)
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn set_draining(&mut self) {
        self.draining = true;
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned.len()
    }

    pub fn holds(&self, task_id: TaskId) -> bool {
        self.assigned.contains_key(&task_id)
    }

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.assigned.get(&task_id)
    }

    /// Record the task and send it to the worker.
    pub fn do_task(&mut self, task: Task) {
        let msg = WsMessage::NewTask {
            task_id: task.task_id,
            function_id: task.function_id.clone(),
            additional_data: task.additional_data.clone(),
        };
        self.known_functions.insert(task.function_id.clone());
        self.assigned.insert(task.task_id, task);
        self.send(msg);
    }

    /// Returns false when the task is not held here.
    pub fn start_task(&mut self, task_id: TaskId, at: DateTime<Utc>) -> bool {
        match self.assigned.get_mut(&task_id) {
            Some(task) => {
                task.mark_started(at);
                true
            }
            None => false,
        }
    }

    pub fn take_task(&mut self, task_id: TaskId) -> Option<Task> {
        self.assigned.remove(&task_id)
    }

    /// Remove and return the tasks the worker has not started.
    pub fn take_unstarted(&mut self) -> Vec<Task> {
        let unstarted: Vec<TaskId> = self
            .assigned
            .values()
            .filter(|t| t.start_ts.is_none())
            .map(|t| t.task_id)
            .collect();
        unstarted
            .into_iter()
            .filter_map(|id| self.assigned.remove(&id))
            .collect()
    }

    /// Remove and return every held task.
    pub fn take_all(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.assigned).into_values().collect()
    }

    /// Queue a frame for the socket. False once the connection is gone.
    pub fn send(&self, msg: WsMessage) -> bool {
        if self.outbound.send(msg).is_err() {
            debug!(worker_id = self.worker_id, "Outbound queue closed");
            return false;
        }
        true
    }
}
