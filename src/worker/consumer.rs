//! Runs one dequeued job instance to completion.
//!
//! Flow per instance:
//! 1. Reject anything that is not `new`/`scheduled` (cancelled instances are
//!    skipped quietly, anything else is forced to `killed`).
//! 2. Claim it with a compare-and-set to `running`.
//! 3. Run the handler in its own task while a heartbeat polls the stored
//!    status; observing `killed` cancels the handler's token.
//! 4. Record the outcome: `done`, `exception` (error or panic), or leave
//!    `killed` untouched when aborted. A killed handler that does not return
//!    within one heartbeat interval is detached and no longer awaited.

use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::worker::instance::JobInstance;
use crate::worker::panic::{PanicCapture, payload_message};
use crate::worker::state::JobStatus;

/// Default interval between status polls while a job runs.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// How the handler task ended.
enum Outcome {
    Completed,
    Failed(anyhow::Error),
    Panicked {
        message: String,
        trace: Option<String>,
    },
    /// Still running after a kill; no longer awaited.
    Detached,
}

/// Executes job instances handed over by a queue.
#[derive(Debug, Clone)]
pub struct Consumer {
    heartbeat_interval: Duration,
}

impl Default for Consumer {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

impl Consumer {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self { heartbeat_interval }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Run one instance. Handler errors and panics are recorded on the
    /// instance and do not surface here; the returned error covers only
    /// instances that could not be started and store failures.
    pub async fn dispatch(&self, job: JobInstance) -> Result<(), JobError> {
        if !claim(&job).await? {
            return Ok(());
        }
        tracing::info!(job_id = %job.id(), job = %job.job_name(), "Job started");

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            job.clone(),
            self.heartbeat_interval,
            cancel.clone(),
            done.clone(),
        ));

        job.start_refresh().await;
        let outcome = self.run_handler(&job, cancel).await;
        job.stop_refresh().await;

        done.cancel();
        let aborted = heartbeat.await.unwrap_or_else(|e| {
            tracing::warn!(job_id = %job.id(), error = %e, "Heartbeat task failed");
            false
        });

        finalize(&job, aborted, outcome).await
    }

    /// Run the handler in its own task. Once `cancel` fires the handler
    /// gets one heartbeat interval to return before it is detached.
    async fn run_handler(&self, job: &JobInstance, cancel: CancellationToken) -> Outcome {
        let handler = job.definition().handler();
        let capture = PanicCapture::new();
        let task_job = job.clone();
        let task_cancel = cancel.clone();
        let mut task =
            tokio::spawn(capture.scope(async move { handler.run(task_cancel, task_job).await }));

        tokio::select! {
            result = &mut task => outcome_of(result, &capture),
            _ = cancel.cancelled() => {
                match tokio::time::timeout(self.heartbeat_interval, &mut task).await {
                    Ok(result) => outcome_of(result, &capture),
                    Err(_) => {
                        tracing::warn!(
                            job_id = %job.id(),
                            grace_ms = self.heartbeat_interval.as_millis() as u64,
                            "Handler ignored kill, detaching it"
                        );
                        detach(job.clone(), task, capture);
                        Outcome::Detached
                    }
                }
            }
        }
    }
}

/// Move the instance to `running`. Returns `false` when it was cancelled
/// before it could start.
async fn claim(job: &JobInstance) -> Result<bool, JobError> {
    loop {
        let status = job.fetch_and_set_status().await?;
        match status {
            JobStatus::Cancelled => {
                tracing::info!(job_id = %job.id(), "Job is cancelled, skipping");
                return Ok(false);
            }
            s if s.is_startable() => {}
            s => {
                job.force_status(JobStatus::Killed).await?;
                tracing::warn!(job_id = %job.id(), status = %s, "Refusing to start job");
                return Err(JobError::InvalidStatus { id: job.id(), status: s });
            }
        }

        match job.set_status(JobStatus::Running).await {
            Ok(()) => return Ok(true),
            // Status moved under us; look again.
            Err(JobError::InvalidTransition { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Poll the stored status until `done` fires. Returns whether a kill was
/// observed, in which case `cancel` has been triggered.
async fn heartbeat(
    job: JobInstance,
    interval: Duration,
    cancel: CancellationToken,
    done: CancellationToken,
) -> bool {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = done.cancelled() => return false,
            _ = ticker.tick() => match job.fetch_and_set_status().await {
                Ok(JobStatus::Killed) => {
                    tracing::info!(job_id = %job.id(), "Kill observed, cancelling handler");
                    cancel.cancel();
                    return true;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job.id(), error = %e, "Heartbeat status check failed");
                }
            },
        }
    }
}

/// Map the join result of a handler task.
fn outcome_of(result: Result<anyhow::Result<()>, JoinError>, capture: &PanicCapture) -> Outcome {
    match result {
        Ok(Ok(())) => Outcome::Completed,
        Ok(Err(e)) => Outcome::Failed(e),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            Outcome::Panicked {
                message: payload_message(payload.as_ref()),
                trace: capture.take(),
            }
        }
        Err(e) => Outcome::Failed(anyhow::anyhow!("handler task was cancelled: {e}")),
    }
}

/// Keep watching a handler that outlived its kill grace, so a late panic
/// still lands in the job log.
fn detach(job: JobInstance, task: JoinHandle<anyhow::Result<()>>, capture: PanicCapture) {
    tokio::spawn(async move {
        match outcome_of(task.await, &capture) {
            Outcome::Completed => {
                tracing::debug!(job_id = %job.id(), "Detached handler returned");
            }
            Outcome::Failed(e) => {
                tracing::warn!(job_id = %job.id(), error = %format!("{e:#}"), "Detached handler failed");
            }
            Outcome::Panicked { message, trace } => {
                tracing::error!(job_id = %job.id(), panic = %message, "Detached handler panicked");
                if let Err(e) = record_panic(&job, &message, trace.as_deref()).await {
                    tracing::warn!(job_id = %job.id(), error = %e, "Failed to log detached panic");
                }
            }
            Outcome::Detached => {}
        }
    });
}

async fn finalize(job: &JobInstance, aborted: bool, outcome: Outcome) -> Result<(), JobError> {
    if aborted || matches!(outcome, Outcome::Detached) {
        tracing::info!(job_id = %job.id(), "Job aborted");
        if let Outcome::Panicked { message, trace } = outcome {
            record_panic(job, &message, trace.as_deref()).await?;
        }
        return Ok(());
    }

    match outcome {
        Outcome::Completed => {
            finish(job, JobStatus::Done).await?;
            tracing::info!(job_id = %job.id(), "Job done");
        }
        Outcome::Failed(e) => {
            let text = format!("{e:#}");
            tracing::warn!(job_id = %job.id(), error = %text, "Job failed");
            job.set_progress_text(text).await?;
            finish(job, JobStatus::Exception).await?;
        }
        Outcome::Panicked { message, trace } => {
            tracing::error!(job_id = %job.id(), panic = %message, "Job panicked");
            record_panic(job, &message, trace.as_deref()).await?;
            job.set_progress_text(message).await?;
            finish(job, JobStatus::Exception).await?;
        }
        Outcome::Detached => {}
    }
    Ok(())
}

async fn record_panic(job: &JobInstance, message: &str, trace: Option<&str>) -> Result<(), JobError> {
    let line = match trace {
        Some(trace) => format!("job panicked: {message}\n{trace}"),
        None => format!("job panicked: {message}"),
    };
    job.add_log(line).await
}

/// Write the final status. A kill that lands after the handler returned
/// but before this write wins, and the instance stays `killed`.
async fn finish(job: &JobInstance, status: JobStatus) -> Result<(), JobError> {
    match job.set_status(status).await {
        Ok(()) => Ok(()),
        Err(JobError::InvalidTransition {
            from: JobStatus::Killed,
            ..
        }) => {
            tracing::info!(job_id = %job.id(), "Job killed after its handler returned");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::store::JobRecord;
    use crate::worker::definition::{JobDefinition, JobHandler, JobOptions, handler_fn};
    use crate::worker::events::JobEvent;
    use crate::worker::instance::JobDeps;
    use crate::worker::instance::tests::test_deps;

    async fn instance_with(deps: &JobDeps, handler: Arc<dyn JobHandler>) -> JobInstance {
        let definition = Arc::new(JobDefinition::new("t".into(), handler, JobOptions::default()));
        let record = JobRecord::new("t", "null", "{}", None);
        deps.store.insert_job(&record).await.unwrap();
        JobInstance::new(record, definition, deps.clone())
    }

    fn fast() -> Consumer {
        Consumer::new(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn completed_handler_marks_done() {
        let deps = test_deps().await;
        let job = instance_with(
            &deps,
            handler_fn(|_cancel, job| async move {
                job.add_log("hello").await?;
                Ok(())
            }),
        )
        .await;

        fast().dispatch(job.clone()).await.unwrap();

        let record = job.reload().await.unwrap();
        assert_eq!(record.status, JobStatus::Done);
        assert_eq!(record.progress, 0);
        assert_eq!(job.logs().await.unwrap()[0].content, "hello");
    }

    #[tokio::test]
    async fn handler_error_marks_exception() {
        let deps = test_deps().await;
        let job = instance_with(
            &deps,
            handler_fn(|_cancel, _job| async { Err(anyhow::anyhow!("boom")) }),
        )
        .await;

        fast().dispatch(job.clone()).await.unwrap();

        let record = job.reload().await.unwrap();
        assert_eq!(record.status, JobStatus::Exception);
        assert_eq!(record.progress_text, "boom");
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let deps = test_deps().await;
        let job = instance_with(
            &deps,
            handler_fn(|_cancel, _job| async {
                panic!("index out of range");
            }),
        )
        .await;

        fast().dispatch(job.clone()).await.unwrap();

        let record = job.reload().await.unwrap();
        assert_eq!(record.status, JobStatus::Exception);
        assert_eq!(record.progress_text, "index out of range");
        let logs = job.logs().await.unwrap();
        assert!(logs.iter().any(|l| l.content.contains("index out of range")));
    }

    #[tokio::test]
    async fn kill_cancels_running_handler() {
        let deps = test_deps().await;
        let iterations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&iterations);
        let job = instance_with(
            &deps,
            handler_fn(move |cancel, _job| {
                let seen = Arc::clone(&seen);
                async move {
                    for _ in 0..50 {
                        if cancel.is_cancelled() {
                            return Ok(());
                        }
                        seen.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Ok(())
                }
            }),
        )
        .await;

        let killer = job.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            killer.set_status(JobStatus::Killed).await.unwrap();
        });

        fast().dispatch(job.clone()).await.unwrap();

        assert_eq!(job.reload().await.unwrap().status, JobStatus::Killed);
        assert!(iterations.load(Ordering::SeqCst) < 50);
    }

    #[tokio::test]
    async fn handler_ignoring_kill_is_detached() {
        let deps = test_deps().await;
        let job = instance_with(
            &deps,
            handler_fn(|_cancel, _job| async {
                tokio::time::sleep(Duration::from_secs(4)).await;
                Ok(())
            }),
        )
        .await;

        let killer = job.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            killer.set_status(JobStatus::Killed).await.unwrap();
        });

        tokio::time::timeout(Duration::from_secs(1), fast().dispatch(job.clone()))
            .await
            .expect("dispatch should not wait for the handler")
            .unwrap();

        assert_eq!(job.reload().await.unwrap().status, JobStatus::Killed);
    }

    #[tokio::test]
    async fn kill_after_return_keeps_killed() {
        let deps = test_deps().await;
        let store = Arc::clone(&deps.store);
        let job = instance_with(
            &deps,
            handler_fn(move |_cancel, job| {
                let store = Arc::clone(&store);
                async move {
                    store
                        .update_job_status(job.id(), JobStatus::Running, JobStatus::Killed)
                        .await?;
                    Ok(())
                }
            }),
        )
        .await;
        let mut events = deps.events.subscribe();

        fast().dispatch(job.clone()).await.unwrap();

        assert_eq!(job.reload().await.unwrap().status, JobStatus::Killed);
        while let Ok(event) = events.try_recv() {
            if let JobEvent::StatusChanged { to, .. } = event {
                assert_ne!(to, JobStatus::Done);
            }
        }
    }

    #[tokio::test]
    async fn cancelled_instance_is_skipped() {
        let deps = test_deps().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let job = instance_with(
            &deps,
            handler_fn(move |_cancel, _job| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
        )
        .await;
        job.set_status(JobStatus::Cancelled).await.unwrap();

        fast().dispatch(job.clone()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(job.reload().await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn finished_instance_is_rejected_and_killed() {
        let deps = test_deps().await;
        let job = instance_with(&deps, handler_fn(|_cancel, _job| async { Ok(()) })).await;
        job.set_status(JobStatus::Running).await.unwrap();
        job.set_status(JobStatus::Done).await.unwrap();

        let err = fast().dispatch(job.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidStatus { status: JobStatus::Done, .. }
        ));
        assert_eq!(err.to_string(), "Invalid job status, current status: done");
        assert_eq!(job.reload().await.unwrap().status, JobStatus::Killed);
    }

    #[tokio::test]
    async fn concurrent_dispatch_runs_handler_once() {
        let deps = test_deps().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let job = instance_with(
            &deps,
            handler_fn(move |_cancel, _job| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                }
            }),
        )
        .await;

        let consumer = fast();
        let (a, b) = tokio::join!(consumer.dispatch(job.clone()), consumer.dispatch(job.clone()));
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn context_is_readable_from_handler() {
        let deps = test_deps().await;
        let definition = Arc::new(JobDefinition::new(
            "ctx".into(),
            handler_fn(|_cancel, job| async move {
                let ctx: serde_json::Value = job.invocation_context().await?;
                job.add_log(ctx["user"].as_str().unwrap_or_default()).await?;
                Ok(())
            }),
            JobOptions::default(),
        ));
        let record = JobRecord::new("ctx", "null", json!({"user": "grace"}).to_string(), None);
        deps.store.insert_job(&record).await.unwrap();
        let job = JobInstance::new(record, definition, deps.clone());

        fast().dispatch(job.clone()).await.unwrap();
        assert_eq!(job.logs().await.unwrap()[0].content, "grace");
    }
}
