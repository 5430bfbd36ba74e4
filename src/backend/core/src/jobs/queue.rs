//! Job submission and batch windowing.
//!
//! Producers push jobs through a [`JobSubmitter`]. A single
//! [`BatchAccumulator`] buffers them and hands a batch to its flush function
//! when the buffer fills up or when no job has arrived for one interval.
//!
//! ```text
//! submit ──▶ [ mpsc ] ──▶ buffer ──(full | idle)──▶ flush(batch, workers)
//! ```

use std::future::Future;
use std::mem;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::BoxedJob;
use super::worker::default_worker_count;
use crate::error::{Result, RollupError};
use crate::telemetry::BatchMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Submission
// ═══════════════════════════════════════════════════════════════════════════════

/// Create a bounded submission queue.
pub fn job_queue(capacity: usize) -> (JobSubmitter, JobReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (JobSubmitter { tx }, JobReceiver { rx })
}

/// Cloneable handle for submitting jobs. Safe to use from any task.
#[derive(Debug, Clone)]
pub struct JobSubmitter {
    tx: mpsc::Sender<BoxedJob>,
}

impl JobSubmitter {
    /// Submit a job, waiting for queue capacity if necessary.
    ///
    /// Fails once the accumulator has stopped.
    pub async fn submit(&self, job: BoxedJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| RollupError::submission_closed())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving end of the submission queue, consumed by the accumulator.
#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::Receiver<BoxedJob>,
}

impl JobReceiver {
    /// Take the next submitted job. `None` once every submitter is gone.
    pub async fn recv(&mut self) -> Option<BoxedJob> {
        self.rx.recv().await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Accumulator
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for batch windowing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Idle time after the last submission before a partial batch is flushed
    pub interval: Duration,
    /// Jobs per batch before an immediate flush
    pub max_batch_size: usize,
    /// Workers requested for each flushed batch
    pub worker_count: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_batch_size: 100,
            worker_count: default_worker_count(),
        }
    }
}

/// Why the accumulator stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorExit {
    /// Cancelled; `dropped` buffered jobs were discarded without running.
    Cancelled { dropped: usize },
    /// Every submitter was dropped; the remaining buffer was flushed.
    InputClosed,
}

/// Groups submitted jobs into batches.
#[derive(Debug, Clone, Default)]
pub struct BatchAccumulator {
    config: BatchConfig,
}

impl BatchAccumulator {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run until `cancel` fires or every submitter is gone.
    ///
    /// `flush` is awaited before the next job is taken, so at most one batch
    /// is in flight. Reaching `max_batch_size` flushes immediately; otherwise
    /// the idle timer restarts on every submission and a non-empty buffer is
    /// flushed when it fires. Cancellation discards the buffer.
    pub async fn run<F, Fut>(
        &self,
        mut input: JobReceiver,
        mut flush: F,
        cancel: CancellationToken,
    ) -> AccumulatorExit
    where
        F: FnMut(Vec<BoxedJob>, usize) -> Fut,
        Fut: Future<Output = ()>,
    {
        let max = self.config.max_batch_size.max(1);
        let interval = self.config.interval;
        let workers = self.config.worker_count;
        let mut buffer: Vec<BoxedJob> = Vec::with_capacity(max);

        let timer = sleep(interval);
        tokio::pin!(timer);

        info!(
            max_batch_size = max,
            interval_ms = interval.as_millis() as u64,
            workers,
            "Batch accumulator started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let dropped = buffer.len();
                    if dropped > 0 {
                        BatchMetrics::dropped(dropped);
                        warn!(dropped, "Accumulator cancelled, discarding buffered jobs");
                    }
                    info!("Batch accumulator stopped");
                    return AccumulatorExit::Cancelled { dropped };
                }

                next = input.recv() => match next {
                    Some(job) => {
                        buffer.push(job);
                        if buffer.len() >= max {
                            let batch = mem::replace(&mut buffer, Vec::with_capacity(max));
                            debug!(batch_size = batch.len(), "Batch full, flushing");
                            BatchMetrics::flushed(batch.len());
                            flush(batch, workers).await;
                        }
                        timer.as_mut().reset(Instant::now() + interval);
                    }
                    None => {
                        if !buffer.is_empty() {
                            let batch = mem::take(&mut buffer);
                            debug!(batch_size = batch.len(), "Input closed, flushing remainder");
                            BatchMetrics::flushed(batch.len());
                            flush(batch, workers).await;
                        }
                        info!("Batch accumulator input closed");
                        return AccumulatorExit::InputClosed;
                    }
                },

                _ = &mut timer => {
                    if !buffer.is_empty() {
                        let batch = mem::replace(&mut buffer, Vec::with_capacity(max));
                        debug!(batch_size = batch.len(), "Batch window idle, flushing");
                        BatchMetrics::flushed(batch.len());
                        flush(batch, workers).await;
                    }
                    timer.as_mut().reset(Instant::now() + interval);
                }
            }
        }
    }
}
