//! In-process queue backed by an unbounded channel.
//!
//! Instances live only in this process. After `listen`, a dispatcher task
//! drains the channel and runs each instance on its own task; scheduled
//! instances sleep on that task until their time comes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{JobError, QueueError};
use crate::queue::{JobResolver, Queue, defer_if_scheduled, kill_instance, remove_instance, until};
use crate::worker::{AbortAction, Consumer, JobDefinition, JobInstance};

pub struct MemoryQueue {
    consumer: Consumer,
    tx: mpsc::UnboundedSender<JobInstance>,
    /// Taken by the dispatcher on `listen`.
    rx: Mutex<Option<mpsc::UnboundedReceiver<JobInstance>>>,
    listening: AtomicBool,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl MemoryQueue {
    pub fn new(consumer: Consumer) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            consumer,
            tx,
            rx: Mutex::new(Some(rx)),
            listening: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of instances waiting in the channel. Always zero once the
    /// dispatcher has taken over.
    pub async fn pending(&self) -> usize {
        self.rx.lock().await.as_ref().map_or(0, |rx| rx.len())
    }

    /// Run the next buffered instance inline, without a dispatcher.
    /// Returns `None` if nothing is buffered or the queue is listening.
    pub async fn consume_next(&self) -> Option<Result<(), JobError>> {
        let job = {
            let mut guard = self.rx.lock().await;
            guard.as_mut()?.try_recv().ok()?
        };
        Some(run_item(self.consumer.clone(), self.shutdown.clone(), job).await)
    }
}

/// Wait out the schedule time, then hand the instance to the consumer.
async fn run_item(
    consumer: Consumer,
    shutdown: CancellationToken,
    job: JobInstance,
) -> Result<(), JobError> {
    if let Some(at) = job.snapshot().await.schedule_time {
        let wait = until(at);
        if !wait.is_zero() {
            tracing::debug!(job_id = %job.id(), wait_ms = wait.as_millis() as u64, "Holding scheduled job");
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
    consumer.dispatch(job).await
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn add(&self, job: JobInstance) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        defer_if_scheduled(&job).await?;
        tracing::debug!(job_id = %job.id(), job = %job.job_name(), "Job enqueued");
        self.tx
            .send(job)
            .map_err(|_| QueueError::Unavailable("memory queue channel closed".into()))
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
        _resolver: Arc<dyn JobResolver>,
    ) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(mut rx) = self.rx.lock().await.take() else {
            return Ok(());
        };

        let consumer = self.consumer.clone();
        let shutdown = self.shutdown.clone();
        let tracker = self.tracker.clone();
        tracing::info!(jobs = definitions.len(), "Memory queue listening");

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    item = rx.recv() => {
                        let Some(job) = item else { break };
                        let consumer = consumer.clone();
                        let shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            let job_id = job.id();
                            if let Err(e) = run_item(consumer, shutdown, job).await {
                                tracing::warn!(job_id = %job_id, error = %e, "Job dispatch failed");
                            }
                        });
                    }
                }
            }
            tracing::debug!("Memory queue dispatcher stopped");
        });
        Ok(())
    }

    async fn shutdown(&self, grace: Duration) -> Result<(), QueueError> {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            return Err(QueueError::ShutdownTimeout {
                grace,
                remaining: self.tracker.len(),
            });
        }
        tracing::info!("Memory queue shut down");
        Ok(())
    }
}
