//! Rollup job system.
//!
//! This module turns calendar time into executed rollups:
//!
//! - **Job Definitions**: The [`Job`] trait and the concrete [`AggregationJob`]
//! - **Scheduler**: Calendar triggers per aggregation period ([`CronTrigger`])
//! - **Queue**: Submission channel and batch windowing ([`BatchAccumulator`])
//! - **Worker**: Bounded concurrent execution of one batch ([`WorkerPool`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Rollup Job System                              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  │
//! │  │ CronTrigger │    │  Submitter  │    │ Accumulator │    │ WorkerPool  │  │
//! │  │ (per period)│───▶│   (mpsc)    │───▶│ (size/idle  │───▶│ (N workers, │  │
//! │  │             │    │             │    │   window)   │    │  deadline)  │  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘  │
//! │         ▲                  ▲                                     │         │
//! │         │                  │                                     ▼         │
//! │   period boundary       backfill                 ┌───────────────────────┐ │
//! │                                                  │    AggregationJob     │ │
//! │                                                  │ lease ▸ aggregate ▸   │ │
//! │                                                  │ convert ▸ insert      │ │
//! │                                                  └───────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use rollup_core::jobs::{job_queue, BatchAccumulator, BatchConfig, WorkerPool};
//!
//! let (submitter, receiver) = job_queue(1024);
//! let pool = WorkerPool::default();
//! let accumulator = BatchAccumulator::new(BatchConfig::default());
//!
//! tokio::spawn(async move {
//!     accumulator
//!         .run(receiver, |batch, workers| {
//!             let pool = pool.clone();
//!             async move {
//!                 pool.run(batch, workers).await;
//!             }
//!         }, shutdown)
//!         .await
//! });
//!
//! submitter.submit(Box::new(job)).await?;
//! ```

pub mod aggregation;
pub mod backfill;
pub mod job;
pub mod period;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use aggregation::{AggregationJob, LeaseCheck, DEFAULT_JOB_TIMEOUT};
pub use backfill::{backfill, BackfillRequest};
pub use job::{BatchId, BoxedJob, Job, JobContext, JobError, JobOutcome, JobResult};
pub use period::{AggregationPeriod, LEASE_SAFETY_MARGIN};
pub use pipeline::{
    validate_metric_name, AggregatedReading, ReadingMetadata, RollupPipeline, TotalValue,
};
pub use queue::{
    job_queue, AccumulatorExit, BatchAccumulator, BatchConfig, JobReceiver, JobSubmitter,
};
pub use scheduler::{CronTrigger, RollupTargets, SystemClock, TriggerConfig, WallClock};
pub use worker::{default_worker_count, BatchReport, JobFailure, WorkerPool, WorkerPoolConfig};
