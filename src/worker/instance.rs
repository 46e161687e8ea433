//! Job instance handle: the view a handler and the engine hold of one
//! submitted job.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;
use crate::store::{JobLog, JobRecord, JobStore};
use crate::worker::definition::JobDefinition;
use crate::worker::events::{DEFAULT_EVENT_CAPACITY, JobEvent, JobSnapshot};
use crate::worker::state::JobStatus;

/// Shared dependencies every job instance handle carries.
#[derive(Clone)]
pub struct JobDeps {
    pub store: Arc<dyn JobStore>,
    pub events: broadcast::Sender<JobEvent>,
    /// How often a refreshing instance publishes a snapshot.
    pub refresh_interval: Duration,
}

impl JobDeps {
    pub fn new(store: Arc<dyn JobStore>, refresh_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            store,
            events,
            refresh_interval,
        }
    }
}

/// Decoded argument and invocation context of an instance.
#[derive(Debug, Clone)]
pub struct JobInfo<A, C = serde_json::Value> {
    pub job_id: Uuid,
    pub job_name: String,
    pub argument: A,
    pub context: C,
}

struct RefreshTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    id: Uuid,
    definition: Arc<JobDefinition>,
    deps: JobDeps,
    /// Last known state of the persisted row. Also serializes writers
    /// going through this handle.
    record: Mutex<JobRecord>,
    refresh: Mutex<Option<RefreshTask>>,
}

/// Cheaply cloneable handle to one job instance.
///
/// Every mutation is persisted immediately. Reads of status, progress and
/// text come from the local cache, which `fetch_and_set_status` and
/// `reload` refresh from the store.
#[derive(Clone)]
pub struct JobInstance {
    inner: Arc<Inner>,
}

impl JobInstance {
    pub fn new(record: JobRecord, definition: Arc<JobDefinition>, deps: JobDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: record.id,
                definition,
                deps,
                record: Mutex::new(record),
                refresh: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn job_name(&self) -> &str {
        self.inner.definition.name()
    }

    pub fn definition(&self) -> &Arc<JobDefinition> {
        &self.inner.definition
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.deps.store
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.inner.deps.events.send(event);
    }

    fn emit_status_change(&self, from: JobStatus, to: JobStatus) {
        if from != to {
            self.emit(JobEvent::StatusChanged {
                id: self.id(),
                job_name: self.job_name().to_string(),
                from,
                to,
            });
        }
    }

    /// Copy of the cached record.
    pub async fn snapshot(&self) -> JobRecord {
        self.inner.record.lock().await.clone()
    }

    /// Cached status.
    pub async fn status(&self) -> JobStatus {
        self.inner.record.lock().await.status
    }

    pub async fn progress(&self) -> u32 {
        self.inner.record.lock().await.progress
    }

    pub async fn progress_text(&self) -> String {
        self.inner.record.lock().await.progress_text.clone()
    }

    /// Re-read the whole record from the store into the cache.
    pub async fn reload(&self) -> Result<JobRecord, JobError> {
        let fresh = self
            .store()
            .get_job(self.id())
            .await?
            .ok_or(JobError::NotFound { id: self.id() })?;
        let mut record = self.inner.record.lock().await;
        let previous = record.status;
        *record = fresh.clone();
        drop(record);
        self.emit_status_change(previous, fresh.status);
        Ok(fresh)
    }

    /// Re-read the persisted status into the cache and return it. This is
    /// how a running job learns about an external kill.
    pub async fn fetch_and_set_status(&self) -> Result<JobStatus, JobError> {
        let status = self
            .store()
            .get_job_status(self.id())
            .await?
            .ok_or(JobError::NotFound { id: self.id() })?;
        let mut record = self.inner.record.lock().await;
        let previous = record.status;
        record.status = status;
        drop(record);
        self.emit_status_change(previous, status);
        Ok(status)
    }

    /// Move to `to` along a legal edge of the state machine.
    ///
    /// The check runs against the persisted status and the write is a
    /// compare-and-set, so of two racing writers only one wins. The loser
    /// gets `InvalidTransition` carrying the status it lost to.
    pub async fn set_status(&self, to: JobStatus) -> Result<(), JobError> {
        let mut record = self.inner.record.lock().await;
        let id = self.id();

        let current = self
            .store()
            .get_job_status(id)
            .await?
            .ok_or(JobError::NotFound { id })?;
        if !current.can_transition_to(to) {
            record.status = current;
            return Err(JobError::InvalidTransition { from: current, to });
        }

        if !self.store().update_job_status(id, current, to).await? {
            let now = self
                .store()
                .get_job_status(id)
                .await?
                .ok_or(JobError::NotFound { id })?;
            record.status = now;
            return Err(JobError::InvalidTransition { from: now, to });
        }

        let previous = record.status;
        apply_status(&mut record, to);
        drop(record);

        tracing::debug!(job_id = %id, from = %current, to = %to, "Job status changed");
        self.emit_status_change(previous, to);
        Ok(())
    }

    /// Overwrite the status without consulting the state machine. Reserved
    /// for the consumer rejecting an instance it cannot start.
    pub(crate) async fn force_status(&self, to: JobStatus) -> Result<(), JobError> {
        let mut record = self.inner.record.lock().await;
        self.store().force_job_status(self.id(), to).await?;
        let previous = record.status;
        apply_status(&mut record, to);
        drop(record);
        self.emit_status_change(previous, to);
        Ok(())
    }

    /// Set the progress percentage. Values above 100 are clamped.
    pub async fn set_progress(&self, percent: u32) -> Result<(), JobError> {
        let percent = percent.min(100);
        let mut record = self.inner.record.lock().await;
        self.store().update_job_progress(self.id(), percent).await?;
        record.progress = percent;
        Ok(())
    }

    pub async fn set_progress_text(&self, text: impl Into<String>) -> Result<(), JobError> {
        let text = text.into();
        let mut record = self.inner.record.lock().await;
        self.store()
            .update_job_progress_text(self.id(), &text)
            .await?;
        record.progress_text = text;
        Ok(())
    }

    /// Append a line to the job log. Persisted immediately.
    pub async fn add_log(&self, line: impl AsRef<str>) -> Result<(), JobError> {
        self.store().append_job_log(self.id(), line.as_ref()).await?;
        Ok(())
    }

    /// All log lines in append order.
    pub async fn logs(&self) -> Result<Vec<JobLog>, JobError> {
        Ok(self.store().list_job_logs(self.id()).await?)
    }

    /// Decode the stored argument as `A`.
    pub async fn argument<A: DeserializeOwned>(&self) -> Result<A, JobError> {
        let raw = self.inner.record.lock().await.argument.clone();
        Ok(serde_json::from_str(&raw)?)
    }

    /// Decode the stored invocation context as `C`.
    pub async fn invocation_context<C: DeserializeOwned>(&self) -> Result<C, JobError> {
        let raw = self.inner.record.lock().await.invocation_context.clone();
        Ok(serde_json::from_str(&raw)?)
    }

    /// Decode argument and context together.
    pub async fn get_job_info<A, C>(&self) -> Result<JobInfo<A, C>, JobError>
    where
        A: DeserializeOwned,
        C: DeserializeOwned,
    {
        Ok(JobInfo {
            job_id: self.id(),
            job_name: self.job_name().to_string(),
            argument: self.argument().await?,
            context: self.invocation_context().await?,
        })
    }

    /// Start publishing periodic snapshots on the event channel. A second
    /// call while refreshing is a no-op.
    pub async fn start_refresh(&self) {
        let mut slot = self.inner.refresh.lock().await;
        if slot.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let job = self.clone();
        let token = stop.clone();
        let period = self.inner.deps.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => job.publish_snapshot().await,
                }
            }
        });
        *slot = Some(RefreshTask { stop, handle });
    }

    /// Stop the refresh task and publish one final snapshot.
    pub async fn stop_refresh(&self) {
        let task = self.inner.refresh.lock().await.take();
        if let Some(task) = task {
            task.stop.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!(job_id = %self.id(), error = %e, "Refresh task ended abnormally");
            }
            self.publish_snapshot().await;
        }
    }

    async fn publish_snapshot(&self) {
        let snapshot = JobSnapshot::from(&*self.inner.record.lock().await);
        self.emit(JobEvent::Progress { snapshot });
    }
}

impl std::fmt::Debug for JobInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInstance")
            .field("id", &self.inner.id)
            .field("job_name", &self.job_name())
            .finish_non_exhaustive()
    }
}

/// Mirror the side effects the store applies on a status write.
fn apply_status(record: &mut JobRecord, to: JobStatus) {
    record.status = to;
    if to == JobStatus::New {
        record.progress = 0;
        record.progress_text.clear();
    }
    record.updated_at = chrono::Utc::now();
}

#[cfg(test)]
pub(crate) mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::worker::definition::{JobOptions, handler_fn};

    pub(crate) async fn test_deps() -> JobDeps {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        JobDeps::new(Arc::new(backend), Duration::from_millis(20))
    }

    pub(crate) async fn test_instance(deps: &JobDeps, argument: serde_json::Value) -> JobInstance {
        let definition = Arc::new(JobDefinition::new(
            "test".into(),
            handler_fn(|_cancel, _job| async { Ok(()) }),
            JobOptions::default(),
        ));
        let record = JobRecord::new("test", argument.to_string(), json!({"user": "ada"}).to_string(), None);
        deps.store.insert_job(&record).await.unwrap();
        JobInstance::new(record, definition, deps.clone())
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Args {
        path: String,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ctx {
        user: String,
    }

    #[tokio::test]
    async fn legal_transitions_persist() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;

        job.set_status(JobStatus::Running).await.unwrap();
        job.set_progress(30).await.unwrap();
        job.set_status(JobStatus::Done).await.unwrap();

        let stored = deps.store.get_job(job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.progress, 30);
        assert_eq!(job.status().await, JobStatus::Done);
        assert_eq!(job.progress().await, 30);
    }

    #[tokio::test]
    async fn illegal_transition_rejected() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;

        let err = job.set_status(JobStatus::Done).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidTransition { from: JobStatus::New, to: JobStatus::Done }
        ));
        assert_eq!(
            deps.store.get_job_status(job.id()).await.unwrap(),
            Some(JobStatus::New)
        );
    }

    #[tokio::test]
    async fn stale_handle_loses_to_store() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;
        let other = job.clone();

        other.set_status(JobStatus::Cancelled).await.unwrap();
        let err = job.set_status(JobStatus::Running).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidTransition { from: JobStatus::Cancelled, .. }
        ));
    }

    #[tokio::test]
    async fn fetch_and_set_status_sees_external_write() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;
        job.set_status(JobStatus::Running).await.unwrap();

        deps.store
            .update_job_status(job.id(), JobStatus::Running, JobStatus::Killed)
            .await
            .unwrap();
        assert_eq!(job.status().await, JobStatus::Running);
        assert_eq!(job.fetch_and_set_status().await.unwrap(), JobStatus::Killed);
        assert_eq!(job.status().await, JobStatus::Killed);
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;

        job.set_progress(250).await.unwrap();
        assert_eq!(job.progress().await, 100);
        job.set_progress_text("halfway").await.unwrap();

        let stored = job.reload().await.unwrap();
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.progress_text, "halfway");
    }

    #[tokio::test]
    async fn logs_in_append_order() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!(null)).await;

        for line in ["one", "two", "three"] {
            job.add_log(line).await.unwrap();
        }
        let lines: Vec<_> = job
            .logs()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.content)
            .collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn job_info_decodes_argument_and_context() {
        let deps = test_deps().await;
        let job = test_instance(&deps, json!({"path": "/tmp/x"})).await;

        let info: JobInfo<Args, Ctx> = job.get_job_info().await.unwrap();
        assert_eq!(info.argument, Args { path: "/tmp/x".into() });
        assert_eq!(info.context, Ctx { user: "ada".into() });
        assert_eq!(info.job_name, "test");

        let err = job.argument::<u64>().await.unwrap_err();
        assert!(matches!(err, JobError::Serialization(_)));
    }

    #[tokio::test]
    async fn refresh_publishes_snapshots() {
        let deps = test_deps().await;
        let mut rx = deps.events.subscribe();
        let job = test_instance(&deps, json!(null)).await;

        job.start_refresh().await;
        job.start_refresh().await;
        job.set_progress(40).await.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        job.stop_refresh().await;

        let mut snapshots = 0;
        let mut last_progress = 0;
        while let Ok(event) = rx.try_recv() {
            if let JobEvent::Progress { snapshot } = event {
                assert_eq!(snapshot.id, job.id());
                snapshots += 1;
                last_progress = snapshot.progress;
            }
        }
        assert!(snapshots >= 2, "expected periodic plus final snapshot, got {snapshots}");
        assert_eq!(last_progress, 40);
    }

    #[tokio::test]
    async fn status_changes_are_broadcast() {
        let deps = test_deps().await;
        let mut rx = deps.events.subscribe();
        let job = test_instance(&deps, json!(null)).await;

        job.set_status(JobStatus::Running).await.unwrap();
        match rx.recv().await.unwrap() {
            JobEvent::StatusChanged { from, to, .. } => {
                assert_eq!(from, JobStatus::New);
                assert_eq!(to, JobStatus::Running);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
