//! Durable job queue and worker pool.
//!
//! Queue messages live in SQLite keyed by job id, so submissions survive a
//! process restart and re-submitting an id can never produce a second
//! delivery: a pending message is overwritten in place, an in-flight or
//! finished one leaves the call a no-op.
//!
//! The worker pool is a fixed set of consumer tasks. Each claims one
//! message at a time, so at most `concurrency` jobs are ever mid-pipeline.
//! A delivered message gets exactly one processing attempt; failures are
//! recorded, never retried automatically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::db::DbHandle;
use crate::errors::QueueError;
use crate::models::JobPayload;

/// Workers re-poll at this interval even without an enqueue notification,
/// which covers messages recovered from a previous process.
const IDLE_POLL: Duration = Duration::from_millis(500);

pub struct JobQueue {
    db: DbHandle,
    notify: Notify,
}

impl JobQueue {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            notify: Notify::new(),
        }
    }

    /// Enqueue a payload under its job id. Overwrite-if-pending,
    /// no-op-if-in-flight.
    pub async fn enqueue(&self, payload: &JobPayload) -> Result<(), QueueError> {
        let job_id = payload.job_id.clone();
        let json = serde_json::to_string(payload)
            .map_err(|e| QueueError::Unavailable(format!("payload serialization: {}", e)))?;

        let enqueued = self
            .db
            .call(move |db| db.enqueue_message(&job_id, &json))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        if enqueued {
            self.notify.notify_one();
        } else {
            tracing::debug!(job_id = %payload.job_id, "Message already in flight, enqueue skipped");
        }
        Ok(())
    }

    /// Claim the oldest pending message. A message whose payload no longer
    /// parses is marked failed and skipped.
    pub async fn claim(&self) -> Result<Option<(String, JobPayload)>, QueueError> {
        let claimed = self
            .db
            .call(|db| db.claim_next_message())
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let Some((job_id, json)) = claimed else {
            return Ok(None);
        };

        match serde_json::from_str::<JobPayload>(&json) {
            Ok(payload) => Ok(Some((job_id, payload))),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Dropping undecodable queue message");
                self.finish(&job_id, false).await?;
                Ok(None)
            }
        }
    }

    pub async fn finish(&self, job_id: &str, success: bool) -> Result<(), QueueError> {
        let job_id = job_id.to_string();
        self.db
            .call(move |db| db.finish_message(&job_id, success))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    pub async fn set_progress(&self, job_id: &str, progress: u8) -> Result<(), QueueError> {
        let job_id = job_id.to_string();
        self.db
            .call(move |db| db.update_message_progress(&job_id, progress))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    pub async fn progress(&self, job_id: &str) -> Result<Option<u8>, QueueError> {
        let job_id = job_id.to_string();
        self.db
            .call(move |db| db.message_progress(&job_id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    pub async fn pending_count(&self) -> Result<usize, QueueError> {
        self.db
            .call(|db| db.pending_message_count())
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    /// Return messages a previous process left in flight to pending.
    /// Called once at startup before the worker pool starts.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let requeued = self
            .db
            .call(|db| db.requeue_inflight_messages())
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        if requeued > 0 {
            tracing::info!(count = requeued, "Requeued in-flight messages from previous run");
            self.notify.notify_one();
        }
        Ok(requeued)
    }

    async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}

/// What the worker pool runs for each claimed message. Implemented by the
/// job processor; test doubles implement it directly.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Process one delivery. Returns whether the job reached a
    /// non-failed outcome. Must not panic the worker: all failure
    /// handling happens inside.
    async fn process(&self, payload: JobPayload) -> bool;
}

pub struct WorkerPool {
    token: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` consumer tasks over the queue.
    pub fn start(concurrency: usize, queue: Arc<JobQueue>, runner: Arc<dyn JobRunner>) -> Self {
        let token = CancellationToken::new();
        let handles = (0..concurrency)
            .map(|worker| {
                let queue = queue.clone();
                let runner = runner.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    worker_loop(worker, queue, runner, token).await;
                })
            })
            .collect();
        tracing::info!(concurrency, "Worker pool started");
        Self { token, handles }
    }

    /// Stop claiming new messages and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<JobQueue>,
    runner: Arc<dyn JobRunner>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }

        match queue.claim().await {
            Ok(Some((job_id, payload))) => {
                tracing::info!(worker, job_id = %job_id, "Worker picked up job");
                let success = runner.process(payload).await;
                if let Err(e) = queue.finish(&job_id, success).await {
                    tracing::error!(worker, job_id = %job_id, error = %e, "Failed to finish queue message");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = queue.wait_for_work() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            Err(e) => {
                tracing::error!(worker, error = %e, "Queue claim failed");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }
}
