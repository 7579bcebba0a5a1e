//! Dispatch router — hands tasks from a durable backlog to connected workers.

pub mod auth;
pub mod config;
pub mod error;
pub mod router;
pub mod store;
pub mod task;
