//! Error types for the job worker.

use std::time::Duration;

use uuid::Uuid;

use crate::worker::state::JobStatus;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job registry, instance and state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {name} is already registered")]
    AlreadyRegistered { name: String },

    #[error("Invalid job name: {0:?}")]
    InvalidName(String),

    #[error("No job registered under the name {name}")]
    UnknownJob { name: String },

    #[error("Job instance {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid job status, current status: {status}")]
    InvalidStatus { id: Uuid, status: JobStatus },

    #[error("Cannot transition job from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job status is {status}, cannot be aborted/canceled")]
    CannotAbort { id: Uuid, status: JobStatus },

    #[error("Invalid argument for job {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("Job {name} does not accept a schedule time")]
    SchedulingDisabled { name: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Queue backend errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("Queue is shut down")]
    ShutDown,

    #[error("Queue did not drain within {grace:?}, {remaining} job(s) still running")]
    ShutdownTimeout { grace: Duration, remaining: usize },

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
