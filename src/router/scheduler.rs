//! Scheduler — matches tasks to workers and reconciles worker departures.
//!
//! Every registry mutation and every single-task dispatch decision runs
//! under one async mutex. Nothing awaits inside that section except lock
//! acquisition: task hand-off goes through the session's outbound queue and
//! storage writes go through the persist queue.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::AdmitError;
use crate::router::persist::{PersistOp, PersistQueue};
use crate::router::protocol::{WsMessage, check_function_id};
use crate::router::registry::Registry;
use crate::router::session::{WorkerId, WorkerSession};
use crate::store::{Database, WorkerRegistration};
use crate::task::{Task, TaskId};

/// Result of offering one task to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to this worker.
    Assigned(WorkerId),
    /// Some session already holds the task.
    AlreadyAssigned,
    /// No connected worker may run it.
    NoCandidate,
    /// The best candidate is at or above the overload threshold.
    Overloaded,
    /// The task cannot be encoded for a worker; it was marked failed.
    Rejected,
}

/// How a worker reported a task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed,
}

/// Per-batch dispatch counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributeReport {
    pub assigned: usize,
    pub already_assigned: usize,
    pub no_candidate: usize,
    pub overloaded: usize,
    pub rejected: usize,
}

impl DistributeReport {
    fn record(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Assigned(_) => self.assigned += 1,
            Dispatch::AlreadyAssigned => self.already_assigned += 1,
            Dispatch::NoCandidate => self.no_candidate += 1,
            Dispatch::Overloaded => self.overloaded += 1,
            Dispatch::Rejected => self.rejected += 1,
        }
    }

    /// Tasks that stay in the backlog.
    pub fn pending(&self) -> usize {
        self.no_candidate + self.overloaded
    }
}

/// What happened to a departing worker's tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    /// Placed on another worker.
    pub redistributed: usize,
    /// Had started; recorded as failed.
    pub failed: usize,
    /// Never started and not placeable; back in the backlog.
    pub released: usize,
}

/// Aggregate load, served by the internal API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub workers: usize,
    pub threads: u64,
    pub tasks: usize,
    /// `tasks / threads`, zero when no threads are connected.
    pub load_average: f64,
}

pub struct Scheduler {
    registry: Mutex<Registry>,
    persist: PersistQueue,
    overload_threshold: f64,
}

impl Scheduler {
    /// Create a scheduler and start its storage writer.
    pub fn new(store: Arc<dyn Database>, overload_threshold: f64) -> Self {
        let (persist, _writer) = PersistQueue::spawn(store);
        Self {
            registry: Mutex::new(Registry::new()),
            persist,
            overload_threshold,
        }
    }

    /// Wait for all storage writes issued so far.
    pub async fn flush(&self) {
        self.persist.flush().await;
    }

    /// Admit an authenticated worker into the pools.
    ///
    /// The AUTH acknowledgement is queued before the lock is released, so
    /// it always precedes the worker's first task.
    pub async fn admit(
        &self,
        registration: WorkerRegistration,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) -> Result<(), AdmitError> {
        let session = WorkerSession::new(registration, outbound);
        let mut registry = self.registry.lock().await;
        registry.admit(session)?;
        if let Some(session) = registry.session(registration.worker_id) {
            session.send(WsMessage::AuthAccepted);
        }
        info!(
            worker_id = registration.worker_id,
            user_id = registration.user_id,
            threads = registration.threads,
            accept_foreign_work = registration.accept_foreign_work,
            workers = registry.len(),
            "Worker admitted"
        );
        Ok(())
    }

    /// Offer a batch of tasks, oldest first.
    pub async fn distribute(&self, tasks: Vec<Task>) -> DistributeReport {
        let mut report = DistributeReport::default();
        for task in tasks {
            report.record(self.distribute_task(task).await);
        }
        report
    }

    /// Offer one task.
    pub async fn distribute_task(&self, task: Task) -> Dispatch {
        let mut registry = self.registry.lock().await;
        self.dispatch_locked(&mut registry, task)
    }

    fn dispatch_locked(&self, registry: &mut Registry, task: Task) -> Dispatch {
        let task_id = task.task_id;
        if registry.holder_of(task_id).is_some() {
            return Dispatch::AlreadyAssigned;
        }
        if let Err(e) = check_function_id(&task.function_id) {
            warn!(task_id, error = %e, "Task cannot be sent to workers, marking failed");
            self.persist.submit(PersistOp::Fail { task });
            return Dispatch::Rejected;
        }

        let worker_id = match select_worker(registry, &task, self.overload_threshold) {
            Selection::Chosen(worker_id) => worker_id,
            Selection::NoCandidate => {
                debug!(task_id, owner = task.owner_user_id, "No eligible worker, task stays pending");
                return Dispatch::NoCandidate;
            }
            Selection::Overloaded(worker_id) => {
                debug!(task_id, worker_id, "Best candidate overloaded, task stays pending");
                return Dispatch::Overloaded;
            }
        };

        let Some(session) = registry.session_mut(worker_id) else {
            return Dispatch::NoCandidate;
        };
        debug!(task_id, worker_id, function_id = %task.function_id, "Dispatching task");
        session.do_task(task);
        registry.record_assignment(task_id, worker_id);
        self.persist.submit(PersistOp::Assign { task_id, worker_id });
        Dispatch::Assigned(worker_id)
    }

    /// Record DS_TASK_START. Returns false for a task the worker does not hold.
    pub async fn task_started(&self, worker_id: WorkerId, task_id: TaskId) -> bool {
        let mut registry = self.registry.lock().await;
        let started = registry
            .session_mut(worker_id)
            .is_some_and(|s| s.start_task(task_id, Utc::now()));
        if !started {
            warn!(worker_id, task_id, "Start reported for a task the worker does not hold");
        }
        started
    }

    /// Record DS_TASK_DONE / DS_TASK_FAIL.
    ///
    /// A task the worker no longer holds (duplicate or stale report) is
    /// ignored and returns false.
    pub async fn complete_task(
        &self,
        worker_id: WorkerId,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(task) = registry
            .session_mut(worker_id)
            .and_then(|s| s.take_task(task_id))
        else {
            warn!(worker_id, task_id, ?outcome, "Completion for a task the worker does not hold");
            return false;
        };
        registry.clear_assignment(task_id);

        match outcome {
            TaskOutcome::Done => {
                debug!(worker_id, task_id, "Task done");
                self.persist.submit(PersistOp::Complete {
                    task,
                    at: Utc::now(),
                });
            }
            TaskOutcome::Failed => {
                info!(worker_id, task_id, "Task failed on worker");
                self.persist.submit(PersistOp::Fail { task });
            }
        }
        true
    }

    /// CLEAR_QUEUE: stop assigning to the worker and move its unstarted
    /// tasks elsewhere. Started tasks stay until they finish.
    pub async fn drain(&self, worker_id: WorkerId) -> DisconnectReport {
        let mut registry = self.registry.lock().await;
        registry.withdraw(worker_id);
        let Some(session) = registry.session_mut(worker_id) else {
            return DisconnectReport::default();
        };
        session.set_draining();
        let unstarted = session.take_unstarted();
        let remaining = session.assigned_count();
        for task in &unstarted {
            registry.clear_assignment(task.task_id);
        }

        let mut report = DisconnectReport::default();
        for task in unstarted {
            let task_id = task.task_id;
            match self.dispatch_locked(&mut registry, task) {
                Dispatch::Assigned(_) => report.redistributed += 1,
                _ => {
                    self.persist.submit(PersistOp::Release { task_id });
                    report.released += 1;
                }
            }
        }
        info!(
            worker_id,
            redistributed = report.redistributed,
            released = report.released,
            remaining,
            "Worker draining"
        );
        report
    }

    /// Remove a departed worker and re-offer everything it held.
    ///
    /// Started tasks are recorded as failed first, then offered like any
    /// other. Unstarted tasks that find no new worker return to the backlog.
    /// Returns `None` if the worker was already gone.
    pub async fn disconnect(&self, worker_id: WorkerId) -> Option<DisconnectReport> {
        let mut registry = self.registry.lock().await;
        let mut session = registry.remove(worker_id)?;

        let mut report = DisconnectReport::default();
        for mut task in session.take_all() {
            let task_id = task.task_id;
            let started = task.start_ts.is_some();
            if started {
                self.persist.submit(PersistOp::Fail { task: task.clone() });
                report.failed += 1;
                task.start_ts = None;
            }

            match self.dispatch_locked(&mut registry, task) {
                Dispatch::Assigned(_) => report.redistributed += 1,
                _ if started => {}
                _ => {
                    self.persist.submit(PersistOp::Release { task_id });
                    report.released += 1;
                }
            }
        }

        self.persist.submit(PersistOp::ReleaseWorker {
            worker_id,
            last_seen: Utc::now(),
        });
        info!(
            worker_id,
            redistributed = report.redistributed,
            failed = report.failed,
            released = report.released,
            workers = registry.len(),
            "Worker removed"
        );
        Some(report)
    }

    /// Remove a worker the router is resetting.
    ///
    /// Nothing is failed or re-offered: the worker was told to reconnect, so
    /// its tasks go straight back to the backlog, started or not.
    pub async fn detach(&self, worker_id: WorkerId) -> Option<DisconnectReport> {
        let mut registry = self.registry.lock().await;
        let mut session = registry.remove(worker_id)?;

        let mut report = DisconnectReport::default();
        for task in session.take_all() {
            self.persist.submit(PersistOp::Release {
                task_id: task.task_id,
            });
            report.released += 1;
        }
        self.persist.submit(PersistOp::ReleaseWorker {
            worker_id,
            last_seen: Utc::now(),
        });
        info!(
            worker_id,
            released = report.released,
            workers = registry.len(),
            "Worker reset"
        );
        Some(report)
    }

    /// Ask the holding worker to abandon a task. Advisory: state is untouched.
    pub async fn request_cancel(&self, task_id: TaskId) -> bool {
        let registry = self.registry.lock().await;
        let Some(session) = registry
            .holder_of(task_id)
            .and_then(|worker_id| registry.session(worker_id))
        else {
            debug!(task_id, "Cancel requested for a task no worker holds");
            return false;
        };
        session.send(WsMessage::CancelTask { task_id })
    }

    /// Number of tasks the worker holds, or `None` if it is not registered.
    pub async fn assigned_count(&self, worker_id: WorkerId) -> Option<usize> {
        let registry = self.registry.lock().await;
        registry.session(worker_id).map(|s| s.assigned_count())
    }

    pub async fn jobs_per_proc(&self, worker_id: WorkerId) -> Option<f64> {
        let registry = self.registry.lock().await;
        registry.session(worker_id).map(|s| s.jobs_per_proc())
    }

    pub async fn stats(&self) -> RouterStats {
        let registry = self.registry.lock().await;
        let threads: u64 = registry.sessions().map(|s| u64::from(s.threads)).sum();
        let tasks: usize = registry.sessions().map(|s| s.assigned_count()).sum();
        RouterStats {
            workers: registry.len(),
            threads,
            tasks,
            load_average: if threads == 0 {
                0.0
            } else {
                tasks as f64 / threads as f64
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Selection {
    Chosen(WorkerId),
    NoCandidate,
    Overloaded(WorkerId),
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    worker_id: WorkerId,
    load: f64,
    warm: bool,
}

/// Pick a worker for `task`.
///
/// Locality: with `prevent_reuse` unset, workers that already ran the
/// function are preferred while one of them is under the threshold. With it
/// set, workers that never ran it are preferred under the same condition.
/// Among the remaining set the lowest load wins, ties going to the lowest
/// worker id.
fn select_worker(registry: &Registry, task: &Task, threshold: f64) -> Selection {
    let candidates: Vec<Candidate> = registry
        .eligible_workers_for(task)
        .into_iter()
        .filter_map(|worker_id| registry.session(worker_id))
        .filter(|s| !s.is_draining())
        .map(|s| Candidate {
            worker_id: s.worker_id,
            load: s.jobs_per_proc(),
            warm: s.knows_function(&task.function_id),
        })
        .collect();

    if candidates.is_empty() {
        return Selection::NoCandidate;
    }

    let preferred: Vec<Candidate> = candidates
        .iter()
        .copied()
        .filter(|c| c.warm != task.prevent_reuse)
        .collect();
    let pool = if preferred.iter().any(|c| c.load < threshold) {
        preferred
    } else {
        candidates
    };

    let best = pool.into_iter().min_by(|a, b| {
        a.load
            .total_cmp(&b.load)
            .then(a.worker_id.cmp(&b.worker_id))
    });

    match best {
        Some(c) if c.load >= threshold => Selection::Overloaded(c.worker_id),
        Some(c) => Selection::Chosen(c.worker_id),
        None => Selection::NoCandidate,
    }
}
