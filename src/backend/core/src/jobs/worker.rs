//! Bounded worker pool that executes one batch of jobs.
//!
//! Each call to [`WorkerPool::run`] spawns exactly `worker_count` tasks that
//! pull jobs from a shared queue until it is empty. Results flow back over a
//! channel and are collected until every job has reported or the batch
//! deadline passes, whichever comes first.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{BatchId, BoxedJob, JobContext, JobError, JobOutcome, JobResult};
use crate::telemetry::{BatchMetrics, JobMetrics};

/// Four workers per available CPU.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 4
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Time a batch may run before outstanding results are abandoned
    pub deadline: Duration,
    /// Name for this pool (for logging)
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            name: "rollup".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// A job that returned an error, or panicked.
#[derive(Debug)]
pub struct JobFailure {
    pub job: String,
    pub error: JobError,
}

/// Aggregate result of one batch.
#[derive(Debug)]
pub struct BatchReport {
    pub batch_id: BatchId,
    /// Jobs handed to the pool
    pub submitted: usize,
    /// Jobs that ran to completion
    pub completed: usize,
    /// Jobs that found their lease already held
    pub skipped: usize,
    pub failures: Vec<JobFailure>,
    /// Whether results were abandoned at the batch deadline
    pub deadline_exceeded: bool,
    pub elapsed: Duration,
}

impl BatchReport {
    fn new(batch_id: BatchId, submitted: usize) -> Self {
        Self {
            batch_id,
            submitted,
            completed: 0,
            skipped: 0,
            failures: Vec::new(),
            deadline_exceeded: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Jobs whose result reached the pool before the deadline.
    pub fn reported(&self) -> usize {
        self.completed + self.skipped + self.failures.len()
    }

    /// Jobs that never reported.
    pub fn abandoned(&self) -> usize {
        self.submitted.saturating_sub(self.reported())
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.deadline_exceeded
    }

    fn record(&mut self, job: String, result: JobResult) {
        match result {
            Ok(JobOutcome::Completed { .. }) => {
                JobMetrics::completed();
                self.completed += 1;
            }
            Ok(JobOutcome::Skipped { .. }) => {
                JobMetrics::skipped();
                self.skipped += 1;
            }
            Err(error) => {
                JobMetrics::failed();
                self.failures.push(JobFailure { job, error });
            }
        }
    }

    fn log(&self, pool: &str) {
        for failure in &self.failures {
            warn!(
                pool = %pool,
                batch = %self.batch_id,
                job = %failure.job,
                code = %failure.error.code(),
                error = %failure.error,
                "Job failed"
            );
        }

        info!(
            pool = %pool,
            batch = %self.batch_id,
            submitted = self.submitted,
            completed = self.completed,
            skipped = self.skipped,
            failed = self.failures.len(),
            abandoned = self.abandoned(),
            elapsed_ms = self.elapsed.as_millis() as u64,
            "Batch finished"
        );
    }
}

/// Executes batches of jobs with bounded concurrency.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Run `jobs` on `worker_count` concurrent workers (at least one).
    ///
    /// Returns once every job has reported or the batch deadline has passed.
    /// Failures never stop the remaining jobs. Past the deadline the batch
    /// token is cancelled, idle workers stop pulling jobs, and results still
    /// outstanding are not waited for.
    pub async fn run(&self, jobs: Vec<BoxedJob>, worker_count: usize) -> BatchReport {
        let started = Instant::now();
        let batch_id = BatchId::new();
        let submitted = jobs.len();
        let mut report = BatchReport::new(batch_id, submitted);

        if submitted == 0 {
            return report;
        }

        let workers = worker_count.max(1);
        let batch_token = CancellationToken::new();
        let (job_tx, job_rx) = mpsc::channel::<BoxedJob>(submitted);
        let (result_tx, mut result_rx) = mpsc::channel::<(String, JobResult)>(submitted);

        // The channel holds the whole batch, so this never waits.
        for job in jobs {
            if job_tx.send(job).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let queue = Arc::new(Mutex::new(job_rx));
        for worker_id in 0..workers {
            tokio::spawn(worker_loop(
                worker_id,
                batch_id,
                queue.clone(),
                result_tx.clone(),
                batch_token.clone(),
            ));
        }
        drop(result_tx);

        debug!(
            pool = %self.config.name,
            batch = %batch_id,
            jobs = submitted,
            workers,
            "Batch started"
        );

        let deadline = started + self.config.deadline;
        while report.reported() < submitted {
            match timeout_at(deadline, result_rx.recv()).await {
                Ok(Some((job, result))) => report.record(job, result),
                Ok(None) => break,
                Err(_) => {
                    report.deadline_exceeded = true;
                    BatchMetrics::deadline_exceeded();
                    batch_token.cancel();
                    warn!(
                        pool = %self.config.name,
                        batch = %batch_id,
                        outstanding = submitted - report.reported(),
                        deadline_secs = self.config.deadline.as_secs_f64(),
                        "Batch deadline exceeded, abandoning outstanding jobs"
                    );
                    break;
                }
            }
        }

        report.elapsed = started.elapsed();
        report.log(&self.config.name);
        report
    }
}

async fn worker_loop(
    worker_id: usize,
    batch_id: BatchId,
    queue: Arc<Mutex<mpsc::Receiver<BoxedJob>>>,
    results: mpsc::Sender<(String, JobResult)>,
    cancellation: CancellationToken,
) {
    loop {
        if cancellation.is_cancelled() {
            break;
        }

        let next = queue.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        let ctx = JobContext::new(worker_id, batch_id, cancellation.clone());
        let result = AssertUnwindSafe(job.execute(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(panic.as_ref()))));

        if results.send((job.name().to_string(), result)).await.is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
