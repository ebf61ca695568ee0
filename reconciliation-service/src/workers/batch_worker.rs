use crate::config::WorkerConfig;
use crate::engine::ReconciliationEngine;
use crate::error::Result;
use crate::models::{AuditEntry, BatchProgress, ReconciliationRun};
use crate::services::metrics;
use crate::services::store::{AuditSink, BatchStore};
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use dashmap::DashMap;
use service_core::error::AppError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Audit source for runs picked up from the queue.
pub const WORKER_SOURCE: &str = "WORKER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub batch_id: Uuid,
    pub requested_by: String,
    pub source: &'static str,
}

impl BatchJob {
    pub fn new(batch_id: Uuid, requested_by: impl Into<String>) -> Self {
        Self {
            batch_id,
            requested_by: requested_by.into(),
            source: WORKER_SOURCE,
        }
    }

    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = source;
        self
    }
}

/// Runs one batch at a time per batch id, retrying storage failures.
#[derive(Clone)]
pub struct BatchRunner {
    engine: ReconciliationEngine,
    audit: Arc<dyn AuditSink>,
    batches: Arc<dyn BatchStore>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl BatchRunner {
    pub fn new(
        engine: ReconciliationEngine,
        audit: Arc<dyn AuditSink>,
        batches: Arc<dyn BatchStore>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            engine,
            audit,
            batches,
            locks: Arc::new(DashMap::new()),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    /// Reconcile `job.batch_id`, waiting for any run of the same batch to finish
    /// first. Retryable failures are attempted up to `retry_attempts` times in
    /// total with exponential backoff starting at `retry_delay`. The batch's
    /// stored status follows the run: PROCESSING while it executes, then
    /// COMPLETED or FAILED. A cancelled run stays PROCESSING.
    pub async fn run(&self, job: &BatchJob, cancel: &CancellationToken) -> Result<ReconciliationRun> {
        let lock = self
            .locks
            .entry(job.batch_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let started = Instant::now();
        let result = {
            let _guard = lock.lock().await;
            tracing::info!(batch_id = %job.batch_id, "Batch run acquired");
            self.track(job.batch_id, self.batches.start_batch(job.batch_id).await);

            let result = self.run_with_retry(job, cancel).await;
            let progress = match &result {
                Ok(run) if run.completed => BatchProgress::completed(run.stats.total),
                Ok(run) => BatchProgress::interrupted(run.stats.total),
                Err(e) => BatchProgress::failed(e.to_string()),
            };
            self.track(job.batch_id, self.batches.update_batch(job.batch_id, progress).await);
            result
        };

        // The map and this task hold the only references once nobody is waiting.
        drop(lock);
        self.locks
            .remove_if(&job.batch_id, |_, l| Arc::strong_count(l) == 1);

        match result {
            Ok(run) => {
                let entry = AuditEntry::reconcile(
                    job.batch_id,
                    &run.stats,
                    run.completed,
                    &job.requested_by,
                    job.source,
                );
                if let Err(e) = self.audit.record(entry).await {
                    metrics::record_error("audit");
                    tracing::warn!(batch_id = %job.batch_id, error = %e, "Failed to write reconcile audit entry");
                }

                tracing::info!(
                    batch_id = %job.batch_id,
                    total = run.stats.total,
                    completed = run.completed,
                    duration_ms = started.elapsed().as_millis(),
                    "Batch run finished"
                );
                Ok(run)
            }
            Err(e) => {
                tracing::error!(
                    batch_id = %job.batch_id,
                    error = %e,
                    duration_ms = started.elapsed().as_millis(),
                    "Batch run failed"
                );
                Err(e)
            }
        }
    }

    fn track(&self, batch_id: Uuid, outcome: Result<()>) {
        if let Err(e) = outcome {
            metrics::record_error("batch_status");
            tracing::warn!(batch_id = %batch_id, error = %e, "Failed to update batch status");
        }
    }

    async fn run_with_retry(&self, job: &BatchJob, cancel: &CancellationToken) -> Result<ReconciliationRun> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_delay)
            .with_max_elapsed_time(None)
            .build();

        let attempts = AtomicU32::new(0);
        let (engine, attempts, max_attempts) = (&self.engine, &attempts, self.retry_attempts);
        let batch_id = job.batch_id;

        retry(backoff, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match engine.reconcile_batch_until(batch_id, cancel).await {
                Ok(run) => Ok(run),
                Err(e) if e.is_retryable() && attempt < max_attempts && !cancel.is_cancelled() => {
                    tracing::warn!(
                        batch_id = %batch_id,
                        attempt = attempt,
                        error = %e,
                        "Reconciliation attempt failed, retrying"
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }
}

/// Producer half of the job queue.
#[derive(Clone)]
pub struct BatchQueue {
    job_tx: mpsc::Sender<BatchJob>,
}

impl BatchQueue {
    pub fn enqueue(&self, job: BatchJob) -> Result<(), AppError> {
        self.job_tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AppError::ServiceUnavailable(anyhow::anyhow!("Batch queue full"))
            }
            mpsc::error::TrySendError::Closed(_) => {
                AppError::ServiceUnavailable(anyhow::anyhow!("Batch worker stopped"))
            }
        })
    }
}

/// Enqueue up to `limit` batches whose last run never finished, oldest first.
/// Stops at the first job the queue refuses. Returns how many were enqueued.
pub async fn requeue_unfinished(
    batches: &dyn BatchStore,
    queue: &BatchQueue,
    limit: usize,
) -> Result<usize> {
    let pending = batches.unfinished_batches(limit).await?;
    let mut enqueued = 0;

    for batch in pending {
        if let Err(e) = queue.enqueue(BatchJob::new(batch.batch_id, batch.uploaded_by)) {
            tracing::warn!(batch_id = %batch.batch_id, error = %e, "Stopped requeueing unfinished batches");
            break;
        }
        enqueued += 1;
    }

    if enqueued > 0 {
        tracing::info!(enqueued = enqueued, "Requeued unfinished batches");
    }
    Ok(enqueued)
}

pub struct BatchWorker {
    runner: BatchRunner,
    concurrency: usize,
    job_rx: mpsc::Receiver<BatchJob>,
    shutdown_token: CancellationToken,
}

impl BatchWorker {
    pub fn new(runner: BatchRunner, config: &WorkerConfig) -> (Self, BatchQueue) {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size.max(1));

        let worker = Self {
            runner,
            concurrency: config.concurrency.max(1),
            job_rx,
            shutdown_token: CancellationToken::new(),
        };

        (worker, BatchQueue { job_tx })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawn the dispatcher. The returned handle resolves once shutdown was
    /// requested and every in-flight run has stopped.
    pub fn start(self) -> JoinHandle<()> {
        tracing::info!(concurrency = self.concurrency, "Starting batch worker");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let shutdown = self.shutdown_token.clone();
        let runner = self.runner;
        let mut job_rx = self.job_rx;

        tokio::spawn(async move {
            let mut in_flight = JoinSet::new();

            loop {
                let job = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Batch dispatcher shutting down");
                        break;
                    }
                    job = job_rx.recv() => match job {
                        Some(job) => job,
                        None => {
                            tracing::info!("Channel closed, batch dispatcher exiting");
                            break;
                        }
                    },
                };

                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                tracing::info!(batch_id = %job.batch_id, "Dispatching batch job");

                let runner = runner.clone();
                let cancel = shutdown.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = runner.run(&job, &cancel).await {
                        metrics::record_error(e.kind());
                    }
                });

                // Reap finished runs so the set stays small.
                while in_flight.try_join_next().is_some() {}
            }

            while in_flight.join_next().await.is_some() {}
            tracing::info!("Batch worker stopped");
        })
    }
}
