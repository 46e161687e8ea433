//! Worker system — job registration, instances and execution.
//!
//! Core components:
//! - `definition` — JobHandler trait, argument shape and options
//! - `registry` — name → definition catalog, built at startup
//! - `state` — Job status state machine (New → Running → Done/Exception/Killed)
//! - `instance` — JobInstance handle over a persisted record
//! - `consumer` — Runs one instance with heartbeat-driven cancellation
//! - `events` — Live progress snapshots and status changes
//! - `worker` — Facade: submit, abort, rerun, update, listen, shutdown

pub mod consumer;
pub mod definition;
pub mod events;
pub mod instance;
mod panic;
pub mod registry;
pub mod state;
pub mod worker;

pub use consumer::Consumer;
pub use definition::{ArgumentShape, JobDefinition, JobHandler, JobOptions, handler_fn};
pub use events::{JobEvent, JobSnapshot};
pub use instance::{JobDeps, JobInfo, JobInstance};
pub use registry::JobRegistry;
pub use state::JobStatus;
pub use worker::{AbortAction, JobRequest, Worker};
