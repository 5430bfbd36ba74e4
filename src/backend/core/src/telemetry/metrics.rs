//! Metric names and descriptions for the rollup scheduler.
//!
//! Counters are recorded through the `metrics` facade. No exporter is
//! installed here; whichever recorder the host process installs receives
//! them.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Jobs finished, labelled by `outcome` (completed, skipped, failed).
pub const JOBS_TOTAL: &str = "rollup_jobs_total";
/// Batches handed to the worker pool.
pub const BATCHES_TOTAL: &str = "rollup_batches_total";
/// Size of each flushed batch.
pub const BATCH_SIZE: &str = "rollup_batch_size";
/// Batches that hit their overall deadline.
pub const BATCH_DEADLINE_EXCEEDED_TOTAL: &str = "rollup_batch_deadline_exceeded_total";
/// Buffered jobs discarded on shutdown.
pub const JOBS_DROPPED_TOTAL: &str = "rollup_jobs_dropped_total";
/// Lease acquisition attempts, labelled by `result` (held, contended, error).
pub const LEASE_ACQUIRE_TOTAL: &str = "rollup_lease_acquire_total";
/// Calendar firings, labelled by `period`.
pub const FIRINGS_TOTAL: &str = "rollup_firings_total";

/// Register descriptions for every rollup metric.
///
/// Safe to call more than once.
pub fn describe_metrics() {
    describe_counter!(JOBS_TOTAL, "Total number of rollup jobs executed, by outcome");
    describe_counter!(BATCHES_TOTAL, "Total number of job batches flushed to the worker pool");
    describe_histogram!(BATCH_SIZE, "Number of jobs in each flushed batch");
    describe_counter!(
        BATCH_DEADLINE_EXCEEDED_TOTAL,
        "Total number of batches abandoned at their deadline"
    );
    describe_counter!(
        JOBS_DROPPED_TOTAL,
        "Total number of buffered jobs dropped at shutdown"
    );
    describe_counter!(LEASE_ACQUIRE_TOTAL, "Total number of lease acquisition attempts");
    describe_counter!(FIRINGS_TOTAL, "Total number of calendar firings");
    describe_counter!("rollup_errors_total", "Total number of errors by code");
}

/// Job outcome counter.
pub struct JobMetrics;

impl JobMetrics {
    pub fn completed() {
        counter!(JOBS_TOTAL, "outcome" => "completed").increment(1);
    }

    pub fn skipped() {
        counter!(JOBS_TOTAL, "outcome" => "skipped").increment(1);
    }

    pub fn failed() {
        counter!(JOBS_TOTAL, "outcome" => "failed").increment(1);
    }
}

/// Batch-level counters.
pub struct BatchMetrics;

impl BatchMetrics {
    pub fn flushed(size: usize) {
        counter!(BATCHES_TOTAL).increment(1);
        histogram!(BATCH_SIZE).record(size as f64);
    }

    pub fn deadline_exceeded() {
        counter!(BATCH_DEADLINE_EXCEEDED_TOTAL).increment(1);
    }

    pub fn dropped(count: usize) {
        counter!(JOBS_DROPPED_TOTAL).increment(count as u64);
    }
}

/// Lease acquisition counter.
pub struct LeaseMetrics;

impl LeaseMetrics {
    pub fn record(result: &'static str) {
        counter!(LEASE_ACQUIRE_TOTAL, "result" => result).increment(1);
    }
}

/// Calendar firing counter.
pub fn record_firing(period: &'static str) {
    counter!(FIRINGS_TOTAL, "period" => period).increment(1);
}
