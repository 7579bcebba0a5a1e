//! Worker router — connections, registry, scheduling and the backlog poller.

pub mod connection;
pub mod internal_api;
pub mod persist;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod ws;

pub use internal_api::internal_routes;
pub use poller::{poll_once, spawn_backlog_poller};
pub use protocol::{MessageType, WsMessage};
pub use scheduler::{Dispatch, RouterStats, Scheduler, TaskOutcome};
pub use session::{SessionState, WorkerId};
pub use ws::{RouterState, worker_routes};
