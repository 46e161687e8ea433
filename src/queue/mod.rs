//! Queue abstraction — hands job instances to a [`Consumer`].
//!
//! Backends:
//! - `memory` — in-process channel, one dispatcher task per queue
//! - `polling` — polls the job store for dispatchable instances
//!
//! [`Consumer`]: crate::worker::Consumer

pub mod memory;
pub mod polling;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{JobError, QueueError};
use crate::worker::{AbortAction, JobDefinition, JobInstance, JobStatus};

pub use memory::MemoryQueue;
pub use polling::PollingQueue;

/// Turns a stored instance id back into a live handle.
#[async_trait]
pub trait JobResolver: Send + Sync {
    async fn resolve(&self, id: Uuid) -> Result<JobInstance, JobError>;
}

/// A job queue backend.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue an instance for execution. An instance with a future
    /// schedule time is moved to `scheduled` and held until then.
    async fn add(&self, job: JobInstance) -> Result<(), QueueError>;

    /// Abort an instance: a running one is moved to `killed` and its
    /// handler is cancelled at the next heartbeat; a pending one is
    /// cancelled; a finished one is left alone and `None` is returned.
    async fn kill(&self, job: &JobInstance) -> Result<Option<AbortAction>, QueueError>;

    /// Withdraw a pending instance. Fails for instances that already
    /// started.
    async fn remove(&self, job: &JobInstance) -> Result<(), QueueError>;

    /// Start dispatching to the consumer. Calling it again is a no-op;
    /// calling it after `shutdown` fails with `QueueError::ShutDown`.
    async fn listen(
        &self,
        definitions: Vec<Arc<JobDefinition>>,
        resolver: Arc<dyn JobResolver>,
    ) -> Result<(), QueueError>;

    /// Stop accepting work and wait up to `grace` for in-flight jobs.
    async fn shutdown(&self, grace: Duration) -> Result<(), QueueError>;
}

/// Move a `new` instance with a future schedule time to `scheduled`.
/// Returns the time it should run at, if deferred.
pub(crate) async fn defer_if_scheduled(
    job: &JobInstance,
) -> Result<Option<DateTime<Utc>>, JobError> {
    let record = job.snapshot().await;
    if !record.is_deferred(Utc::now()) {
        return Ok(None);
    }
    if record.status == JobStatus::New {
        job.set_status(JobStatus::Scheduled).await?;
    }
    Ok(record.schedule_time)
}

/// Shared kill semantics for every backend. Reports what was done,
/// judged against the stored status rather than the cached one.
pub(crate) async fn kill_instance(job: &JobInstance) -> Result<Option<AbortAction>, JobError> {
    loop {
        let status = job.fetch_and_set_status().await?;
        let (target, action) = match status {
            JobStatus::Running => (JobStatus::Killed, AbortAction::Killed),
            JobStatus::New | JobStatus::Scheduled => (JobStatus::Cancelled, AbortAction::Cancelled),
            _ => {
                tracing::debug!(job_id = %job.id(), status = %status, "Kill on finished job ignored");
                return Ok(None);
            }
        };

        match job.set_status(target).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id(), from = %status, to = %target, "Job aborted");
                return Ok(Some(action));
            }
            // Lost a race with the consumer; re-evaluate against the new status.
            Err(JobError::InvalidTransition { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Shared remove semantics for every backend.
pub(crate) async fn remove_instance(job: &JobInstance) -> Result<(), JobError> {
    match job.fetch_and_set_status().await? {
        JobStatus::Cancelled => Ok(()),
        _ => {
            job.set_status(JobStatus::Cancelled).await?;
            tracing::info!(job_id = %job.id(), "Job removed from queue");
            Ok(())
        }
    }
}

/// Time left until `at`, zero if it has passed.
pub(crate) fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::worker::instance::tests::{test_deps, test_instance};

    #[tokio::test]
    async fn kill_running_marks_killed() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;
        job.set_status(JobStatus::Running).await.unwrap();

        assert_eq!(kill_instance(&job).await.unwrap(), Some(AbortAction::Killed));
        assert_eq!(job.status().await, JobStatus::Killed);
    }

    #[tokio::test]
    async fn kill_pending_marks_cancelled() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;

        assert_eq!(kill_instance(&job).await.unwrap(), Some(AbortAction::Cancelled));
        assert_eq!(job.status().await, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn kill_finished_is_noop() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;
        job.set_status(JobStatus::Running).await.unwrap();
        job.set_status(JobStatus::Done).await.unwrap();

        assert_eq!(kill_instance(&job).await.unwrap(), None);
        assert_eq!(job.reload().await.unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn kill_reports_finish_behind_a_stale_handle() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;
        job.set_status(JobStatus::Running).await.unwrap();
        // Another process finishes it; this handle still caches `running`.
        deps.store
            .update_job_status(job.id(), JobStatus::Running, JobStatus::Done)
            .await
            .unwrap();
        assert_eq!(job.status().await, JobStatus::Running);

        assert_eq!(kill_instance(&job).await.unwrap(), None);
        assert_eq!(job.status().await, JobStatus::Done);
    }

    #[tokio::test]
    async fn remove_running_fails() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;
        job.set_status(JobStatus::Running).await.unwrap();

        let err = remove_instance(&job).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidTransition { from: JobStatus::Running, to: JobStatus::Cancelled }
        ));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;

        remove_instance(&job).await.unwrap();
        remove_instance(&job).await.unwrap();
        assert_eq!(job.status().await, JobStatus::Cancelled);
    }

    #[test]
    fn until_past_is_zero() {
        assert_eq!(until(Utc::now() - chrono::Duration::seconds(5)), Duration::ZERO);
        assert!(until(Utc::now() + chrono::Duration::seconds(5)) > Duration::from_secs(3));
    }
}
