//! Background work: the processor registry, the task manager that drives
//! retryable multi-step tasks, and lock-guarded cron jobs.

#![forbid(unsafe_code)]

pub mod cleanup;
pub mod config;
pub mod cron;
pub mod manager;
pub mod registry;

pub use cleanup::register_namespace_cleanup;
pub use config::TaskConfig;
pub use cron::ExpiryJob;
pub use manager::{TaskManager, TaskManagerHandle};
pub use registry::{Processor, Registry};
