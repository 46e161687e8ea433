//! Background job execution with persisted status, progress
//! and logs, cooperative kill, and pluggable queues.

pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{Error, Result};
pub use queue::{MemoryQueue, PollingQueue, Queue};
pub use store::{JobStore, LibSqlBackend};
pub use worker::{
    JobInstance, JobOptions, JobRegistry, JobRequest, JobStatus, Worker, handler_fn,
};
