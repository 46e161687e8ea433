//! `JobStore` trait — the persistence interface the engine works against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::worker::state::JobStatus;

/// A persisted job instance row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_name: String,
    pub status: JobStatus,
    /// Serialized (JSON) handler argument.
    pub argument: String,
    /// Serialized (JSON) snapshot of caller-provided context.
    pub invocation_context: String,
    pub progress: u32,
    pub progress_text: String,
    pub schedule_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh `New` record.
    pub fn new(
        job_name: impl Into<String>,
        argument: impl Into<String>,
        invocation_context: impl Into<String>,
        schedule_time: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            status: JobStatus::New,
            argument: argument.into(),
            invocation_context: invocation_context.into(),
            progress: 0,
            progress_text: String::new(),
            schedule_time,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record carries a schedule time that has not passed yet.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.schedule_time.is_some_and(|at| at > now)
    }
}

/// One line of a job's log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobLog {
    pub id: Uuid,
    pub job_instance_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic job persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Instances ───────────────────────────────────────────────────

    /// Insert a new job instance.
    async fn insert_job(&self, job: &JobRecord) -> Result<(), DatabaseError>;

    /// Get a job instance by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    /// Read only the persisted status of a job instance.
    async fn get_job_status(&self, id: Uuid) -> Result<Option<JobStatus>, DatabaseError>;

    /// Compare-and-set the status: writes `to` only if the stored status is
    /// still `from`. Returns whether the row was updated.
    ///
    /// Moving to `New` resets progress to 0 and clears the progress text.
    /// Other moves leave progress as the handler last set it.
    async fn update_job_status(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, DatabaseError>;

    /// Overwrite the status unconditionally.
    async fn force_job_status(&self, id: Uuid, status: JobStatus) -> Result<(), DatabaseError>;

    /// Update the progress percentage.
    async fn update_job_progress(&self, id: Uuid, progress: u32) -> Result<(), DatabaseError>;

    /// Update the human-readable progress text.
    async fn update_job_progress_text(&self, id: Uuid, text: &str) -> Result<(), DatabaseError>;

    /// List instances in a given status, oldest first.
    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError>;

    /// Instances ready to be started at `now`: `new` ones without a future
    /// schedule time, and `scheduled` ones whose time has come. Oldest first.
    async fn list_dispatchable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError>;

    // ── Logs ────────────────────────────────────────────────────────

    /// Append a log line to a job instance.
    async fn append_job_log(&self, job_id: Uuid, content: &str) -> Result<JobLog, DatabaseError>;

    /// All log lines of a job instance in append order.
    async fn list_job_logs(&self, job_id: Uuid) -> Result<Vec<JobLog>, DatabaseError>;
}
