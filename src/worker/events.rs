//! Live job snapshots and status changes for viewers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::store::JobRecord;
use crate::worker::state::JobStatus;

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Point-in-time view of a job instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub job_name: String,
    pub status: JobStatus,
    pub progress: u32,
    pub progress_text: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobSnapshot {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            job_name: record.job_name.clone(),
            status: record.status,
            progress: record.progress,
            progress_text: record.progress_text.clone(),
            updated_at: record.updated_at,
        }
    }
}

/// Event published on the worker's broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Periodic snapshot while a job is being refreshed.
    Progress { snapshot: JobSnapshot },
    /// The status of a job changed.
    StatusChanged {
        id: Uuid,
        job_name: String,
        from: JobStatus,
        to: JobStatus,
    },
}

impl JobEvent {
    /// The job instance this event is about.
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Progress { snapshot } => snapshot.id,
            Self::StatusChanged { id, .. } => *id,
        }
    }
}
