//! Backlog poller — feeds pending tasks from storage to the scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::scheduler::{DistributeReport, Scheduler};
use crate::store::Database;

/// Run one poll: read the backlog and offer it, oldest first.
///
/// A storage error skips the tick; the same rows are read again next time.
pub async fn poll_once(store: &dyn Database, scheduler: &Scheduler) -> Option<DistributeReport> {
    // Assignment and release writes issued so far must be visible to the read.
    scheduler.flush().await;

    let tasks = match store.fetch_pending_tasks().await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(error = %e, "Backlog poll failed, skipping tick");
            return None;
        }
    };
    if tasks.is_empty() {
        return Some(DistributeReport::default());
    }

    let total = tasks.len();
    let report = scheduler.distribute(tasks).await;
    if report.assigned > 0 {
        info!(
            pending = total,
            assigned = report.assigned,
            waiting = report.pending(),
            "Dispatched backlog"
        );
    } else {
        debug!(pending = total, "No backlog task could be placed");
    }
    Some(report)
}

/// Spawn the poll loop. It stops when `shutdown` flips to true.
pub fn spawn_backlog_poller(
    store: Arc<dyn Database>,
    scheduler: Arc<Scheduler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    poll_once(store.as_ref(), &scheduler).await;
                }
                _ = shutdown.changed() => {
                    debug!("Backlog poller stopping");
                    break;
                }
            }
        }
    })
}
