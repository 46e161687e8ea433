//! Worker facade — submission and lifecycle control over a queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{Error, JobError};
use crate::queue::{JobResolver, Queue};
use crate::store::{JobLog, JobRecord, JobStore};
use crate::worker::events::JobEvent;
use crate::worker::instance::{JobDeps, JobInstance};
use crate::worker::registry::JobRegistry;
use crate::worker::state::JobStatus;

/// A request to run a registered job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    job_name: String,
    argument: serde_json::Value,
    context: serde_json::Map<String, serde_json::Value>,
    schedule_time: Option<DateTime<Utc>>,
}

impl JobRequest {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            argument: serde_json::Value::Null,
            context: serde_json::Map::new(),
            schedule_time: None,
        }
    }

    /// Set the handler argument.
    pub fn argument<T: Serialize>(mut self, argument: &T) -> Result<Self, JobError> {
        self.argument = serde_json::to_value(argument)?;
        Ok(self)
    }

    /// Add one entry to the invocation context snapshot.
    pub fn context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Defer execution until `at`.
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_time = Some(at);
        self
    }
}

/// What an abort request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortAction {
    /// The instance was running and has been marked killed.
    Killed,
    /// The instance had not started and has been cancelled.
    Cancelled,
}

/// Resolves stored instances against the registry.
struct StoreResolver {
    registry: Arc<JobRegistry>,
    deps: JobDeps,
}

#[async_trait]
impl JobResolver for StoreResolver {
    async fn resolve(&self, id: Uuid) -> Result<JobInstance, JobError> {
        let record = self
            .deps
            .store
            .get_job(id)
            .await?
            .ok_or(JobError::NotFound { id })?;
        let definition = self
            .registry
            .lookup(&record.job_name)
            .ok_or_else(|| JobError::UnknownJob {
                name: record.job_name.clone(),
            })?;
        Ok(JobInstance::new(record, definition, self.deps.clone()))
    }
}

/// Entry point for applications: submit jobs, abort, rerun and inspect
/// them, and drive the queue's lifecycle.
pub struct Worker {
    registry: Arc<JobRegistry>,
    queue: Arc<dyn Queue>,
    resolver: Arc<StoreResolver>,
    shutdown_grace: Duration,
}

impl Worker {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn Queue>,
        config: &WorkerConfig,
    ) -> Self {
        let deps = JobDeps::new(store, config.refresh_interval);
        Self {
            resolver: Arc::new(StoreResolver {
                registry: Arc::clone(&registry),
                deps,
            }),
            registry,
            queue,
            shutdown_grace: config.shutdown_grace,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    fn deps(&self) -> &JobDeps {
        &self.resolver.deps
    }

    /// Subscribe to status changes and progress snapshots of every job.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.deps().events.subscribe()
    }

    /// Handle for a stored instance.
    pub async fn instance(&self, id: Uuid) -> Result<JobInstance, Error> {
        Ok(self.resolver.resolve(id).await?)
    }

    /// Create and enqueue a new instance.
    pub async fn submit(&self, request: JobRequest) -> Result<JobInstance, Error> {
        let definition =
            self.registry
                .lookup(&request.job_name)
                .ok_or_else(|| JobError::UnknownJob {
                    name: request.job_name.clone(),
                })?;
        definition.validate_argument(&request.argument)?;
        if request.schedule_time.is_some() && !definition.scheduling_enabled() {
            return Err(JobError::SchedulingDisabled {
                name: request.job_name,
            }
            .into());
        }

        let record = JobRecord::new(
            request.job_name,
            request.argument.to_string(),
            serde_json::Value::Object(request.context).to_string(),
            request.schedule_time,
        );
        self.deps().store.insert_job(&record).await?;
        let job = JobInstance::new(record, definition, self.deps().clone());
        self.enqueue(&job).await?;

        tracing::info!(job_id = %job.id(), job = %job.job_name(), "Job submitted");
        Ok(job)
    }

    /// Hand an instance to the queue. An instance the queue refused is
    /// cancelled so it is never picked up later.
    async fn enqueue(&self, job: &JobInstance) -> Result<(), Error> {
        if let Err(e) = self.queue.add(job.clone()).await {
            tracing::warn!(job_id = %job.id(), error = %e, "Enqueue failed, cancelling job");
            if let Err(cancel_err) = job.force_status(JobStatus::Cancelled).await {
                tracing::warn!(job_id = %job.id(), error = %cancel_err, "Failed to cancel unqueued job");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Abort an instance: kill it if running, cancel it if pending.
    pub async fn abort(&self, id: Uuid) -> Result<AbortAction, Error> {
        let job = self.instance(id).await?;
        match job.status().await {
            JobStatus::Running => match self.queue.kill(&job).await? {
                Some(action) => Ok(action),
                // Finished between the lookup and the kill.
                None => Err(JobError::CannotAbort { id, status: job.status().await }.into()),
            },
            JobStatus::New | JobStatus::Scheduled => {
                self.queue.remove(&job).await?;
                Ok(AbortAction::Cancelled)
            }
            status => Err(JobError::CannotAbort { id, status }.into()),
        }
    }

    /// Reset a finished instance to `new` and enqueue it again. Logs are
    /// kept; progress and progress text are reset.
    pub async fn rerun(&self, id: Uuid) -> Result<JobInstance, Error> {
        let job = self.instance(id).await?;
        job.set_status(JobStatus::New).await?;
        self.enqueue(&job).await?;
        tracing::info!(job_id = %id, job = %job.job_name(), "Job rerun");
        Ok(job)
    }

    /// Abort an instance and submit a replacement with a new argument and
    /// the same invocation context.
    pub async fn update<T: Serialize>(&self, id: Uuid, argument: &T) -> Result<JobInstance, Error> {
        let old = self.instance(id).await?;
        let record = old.snapshot().await;
        let context = match old.invocation_context::<serde_json::Value>().await? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        self.abort(id).await?;

        let mut request = JobRequest::new(record.job_name).argument(argument)?;
        request.context = context;
        request.schedule_time = record.schedule_time.filter(|at| *at > Utc::now());
        let replacement = self.submit(request).await?;
        tracing::info!(old_job_id = %id, job_id = %replacement.id(), "Job updated");
        Ok(replacement)
    }

    /// Log lines of an instance in append order.
    pub async fn logs(&self, id: Uuid) -> Result<Vec<JobLog>, Error> {
        Ok(self.deps().store.list_job_logs(id).await?)
    }

    /// Instances currently in `status`, oldest first.
    pub async fn list(&self, status: JobStatus, limit: usize) -> Result<Vec<JobRecord>, Error> {
        Ok(self.deps().store.list_jobs_by_status(status, limit).await?)
    }

    /// Start dispatching registered jobs.
    pub async fn listen(&self) -> Result<(), Error> {
        let resolver: Arc<dyn JobResolver> = self.resolver.clone();
        self.queue
            .listen(self.registry.definitions(), resolver)
            .await?;
        tracing::info!(jobs = ?self.registry.names(), "Worker listening");
        Ok(())
    }

    /// Stop the queue, waiting up to the configured grace period.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.queue.shutdown(self.shutdown_grace).await?;
        tracing::info!("Worker shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::error::QueueError;
    use crate::queue::MemoryQueue;
    use crate::store::LibSqlBackend;
    use crate::worker::{Consumer, JobOptions, handler_fn};

    #[derive(Debug, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    async fn worker() -> (Worker, Arc<MemoryQueue>) {
        let mut registry = JobRegistry::new();
        registry
            .register(
                "greet",
                handler_fn(|_cancel, job| async move {
                    let greeting: Greeting = job.argument().await?;
                    job.add_log(format!("hello {}", greeting.name)).await?;
                    Ok(())
                }),
                JobOptions::new().argument::<Greeting>(),
            )
            .unwrap();
        registry
            .register(
                "later",
                handler_fn(|_cancel, _job| async { Ok(()) }),
                JobOptions::new().scheduling(true),
            )
            .unwrap();

        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(MemoryQueue::new(Consumer::new(Duration::from_millis(20))));
        let config = WorkerConfig::default();
        let worker = Worker::new(Arc::new(registry), store, queue.clone(), &config);
        (worker, queue)
    }

    #[tokio::test]
    async fn submit_unknown_job_fails() {
        let (worker, _) = worker().await;
        let err = worker.submit(JobRequest::new("nope")).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::UnknownJob { .. })));
    }

    #[tokio::test]
    async fn submit_rejects_bad_argument() {
        let (worker, queue) = worker().await;
        let request = JobRequest::new("greet").argument(&json!({"nom": 1})).unwrap();
        let err = worker.submit(request).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidArgument { .. })));
        assert_eq!(queue.pending().await, 0);
    }

    #[tokio::test]
    async fn submit_rejects_schedule_when_disabled() {
        let (worker, _) = worker().await;
        let request = JobRequest::new("greet")
            .argument(&Greeting { name: "x".into() })
            .unwrap()
            .schedule_at(Utc::now() + chrono::Duration::minutes(5));
        let err = worker.submit(request).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::SchedulingDisabled { .. })));
    }

    #[tokio::test]
    async fn submit_persists_and_runs() {
        let (worker, queue) = worker().await;
        let request = JobRequest::new("greet")
            .argument(&Greeting { name: "ada".into() })
            .unwrap()
            .context("operator", "cli");
        let job = worker.submit(request).await.unwrap();

        let stored = worker.instance(job.id()).await.unwrap().snapshot().await;
        assert_eq!(stored.status, JobStatus::New);
        assert_eq!(stored.invocation_context, r#"{"operator":"cli"}"#);

        queue.consume_next().await.unwrap().unwrap();
        let logs = worker.logs(job.id()).await.unwrap();
        assert_eq!(logs[0].content, "hello ada");
        assert_eq!(worker.list(JobStatus::Done, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abort_pending_then_finished() {
        let (worker, _) = worker().await;
        let job = worker.submit(JobRequest::new("later")).await.unwrap();

        assert_eq!(worker.abort(job.id()).await.unwrap(), AbortAction::Cancelled);
        let err = worker.abort(job.id()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Job(JobError::CannotAbort { status: JobStatus::Cancelled, .. })
        ));
        assert_eq!(
            err.to_string(),
            "Job error: Job status is cancelled, cannot be aborted/canceled"
        );
    }

    #[tokio::test]
    async fn rerun_requires_terminal_status() {
        let (worker, queue) = worker().await;
        let job = worker.submit(JobRequest::new("later")).await.unwrap();

        let err = worker.rerun(job.id()).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidTransition { .. })));

        queue.consume_next().await.unwrap().unwrap();
        let rerun = worker.rerun(job.id()).await.unwrap();
        assert_eq!(rerun.status().await, JobStatus::New);
        assert_eq!(rerun.progress().await, 0);
        assert_eq!(queue.pending().await, 1);
    }

    #[tokio::test]
    async fn update_replaces_pending_instance() {
        let (worker, _) = worker().await;
        let request = JobRequest::new("greet")
            .argument(&Greeting { name: "old".into() })
            .unwrap()
            .context("operator", "cli");
        let old = worker.submit(request).await.unwrap();

        let new = worker
            .update(old.id(), &Greeting { name: "new".into() })
            .await
            .unwrap();

        assert_ne!(new.id(), old.id());
        assert_eq!(old.reload().await.unwrap().status, JobStatus::Cancelled);
        let greeting: Greeting = new.argument().await.unwrap();
        assert_eq!(greeting.name, "new");
        let ctx: serde_json::Value = new.invocation_context().await.unwrap();
        assert_eq!(ctx["operator"], "cli");
    }

    #[tokio::test]
    async fn submit_after_shutdown_cancels_record() {
        let (worker, _) = worker().await;
        worker.shutdown().await.unwrap();

        let err = worker.submit(JobRequest::new("later")).await.unwrap_err();
        assert!(matches!(err, Error::Queue(QueueError::ShutDown)));
        let cancelled = worker.list(JobStatus::Cancelled, 10).await.unwrap();
        assert_eq!(cancelled.len(), 1);
    }
}
