//! Store-polling queue.
//!
//! The job store is the queue: `add` only records the scheduling intent,
//! and a poll loop picks up dispatchable instances every `poll_interval`.
//! Instances survive a restart and are picked up by the next listener.
//!
//! Double dispatch inside one process is prevented by an in-flight set;
//! across processes, the consumer's compare-and-set claim decides.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError};
use crate::queue::{JobResolver, Queue, defer_if_scheduled, kill_instance, remove_instance};
use crate::store::JobStore;
use crate::worker::{AbortAction, Consumer, JobDefinition, JobInstance};

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of instances fetched per poll.
pub const DEFAULT_POLL_BATCH: usize = 32;

struct Shared {
    store: Arc<dyn JobStore>,
    consumer: Consumer,
    batch_size: usize,
    in_flight: Mutex<HashSet<Uuid>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

pub struct PollingQueue {
    shared: Arc<Shared>,
    poll_interval: Duration,
    listening: AtomicBool,
}

impl PollingQueue {
    pub fn new(store: Arc<dyn JobStore>, consumer: Consumer) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                consumer,
                batch_size: DEFAULT_POLL_BATCH,
                in_flight: Mutex::new(HashSet::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            listening: AtomicBool::new(false),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set how many instances one poll may pick up. Only effective before
    /// `listen`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.batch_size = batch_size.max(1);
        }
        self
    }

    /// Number of instances currently being dispatched by this process.
    pub async fn in_flight(&self) -> usize {
        self.shared.in_flight.lock().await.len()
    }
}

impl Shared {
    /// One poll: fetch dispatchable instances and start the ones this
    /// listener knows. Returns how many were started.
    async fn poll_once(
        self: &Arc<Self>,
        names: &HashSet<String>,
        resolver: &Arc<dyn JobResolver>,
    ) -> Result<usize, DatabaseError> {
        let records = self
            .store
            .list_dispatchable_jobs(Utc::now(), self.batch_size)
            .await?;

        let mut started = 0;
        for record in records {
            if !names.contains(&record.job_name) {
                debug!(job_id = %record.id, job = %record.job_name, "No definition for job, leaving it");
                continue;
            }
            if !self.in_flight.lock().await.insert(record.id) {
                continue;
            }

            started += 1;
            let shared = Arc::clone(self);
            let resolver = Arc::clone(resolver);
            let id = record.id;
            self.tracker.spawn(async move {
                match resolver.resolve(id).await {
                    Ok(job) => {
                        if let Err(e) = shared.consumer.dispatch(job).await {
                            warn!(job_id = %id, error = %e, "Job dispatch failed");
                        }
                    }
                    Err(e) => warn!(job_id = %id, error = %e, "Failed to resolve job"),
                }
                shared.in_flight.lock().await.remove(&id);
            });
        }
        Ok(started)
    }
}

#[async_trait]
impl Queue for PollingQueue {
    async fn add(&self, job: JobInstance) -> Result<(), QueueError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        let deferred = defer_if_scheduled(&job).await?;
        debug!(job_id = %job.id(), job = %job.job_name(), scheduled_for = ?deferred, "Job enqueued");
        Ok(())
    }

    async fn kill(&self, job: &JobInstance) -> Result<Option<AbortAction>, QueueError> {
        Ok(kill_instance(job).await?)
    }

    async fn remove(&self, job: &JobInstance) -> Result<(), QueueError> {
        Ok(remove_instance(job).await?)
    }

    async fn listen(
        &self,
        definitions: Vec<Arc<JobDefinition>>,
        resolver: Arc<dyn JobResolver>,
    ) -> Result<(), QueueError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let names: HashSet<String> = definitions.iter().map(|d| d.name().to_string()).collect();
        let shared = Arc::clone(&self.shared);
        let poll_interval = self.poll_interval;
        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            jobs = names.len(),
            "Polling queue listening",
        );

        self.shared.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => match shared.poll_once(&names, &resolver).await {
                        Ok(0) => {}
                        Ok(started) => debug!(started, "Poll cycle dispatched jobs"),
                        Err(e) => warn!(error = %e, "Poll cycle failed"),
                    },
                }
            }
            info!("Polling queue stopped");
        });
        Ok(())
    }

    async fn shutdown(&self, grace: Duration) -> Result<(), QueueError> {
        self.shared.shutdown.cancel();
        self.shared.tracker.close();
        if tokio::time::timeout(grace, self.shared.tracker.wait())
            .await
            .is_err()
        {
            return Err(QueueError::ShutdownTimeout {
                grace,
                remaining: self.shared.tracker.len(),
            });
        }
        Ok(())
    }
}
