//! Calendar triggers that turn period boundaries into rollup jobs.
//!
//! One task runs per configured period. Each task sleeps until the next
//! boundary of its period in the configured timezone, then builds one
//! [`AggregationJob`] per tracked metric and submits it. A failure while
//! building or submitting is logged and the task moves on to the next
//! boundary.
//!
//! Sleeping happens on tokio's monotonic clock, but a boundary only fires
//! once the [`WallClock`] has reached it. Each following boundary is
//! computed from the one just fired, so a wall clock stepping backwards
//! never fires the same boundary twice.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aggregation::{AggregationJob, LeaseCheck, DEFAULT_JOB_TIMEOUT};
use super::job::BoxedJob;
use super::pipeline::RollupPipeline;
use super::queue::JobSubmitter;
use super::AggregationPeriod;
use crate::error::{ErrorCode, Result, RollupError};
use crate::lease::{LeaseCoordinator, LeaseKey};
use crate::store::DocumentStore;
use crate::telemetry::metrics::record_firing;

/// What the triggers schedule.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub timezone: Tz,
    pub periods: Vec<AggregationPeriod>,
    pub metrics: Vec<String>,
    pub job_timeout: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Australia::Perth,
            periods: vec![
                AggregationPeriod::Daily,
                AggregationPeriod::Weekly,
                AggregationPeriod::Monthly,
                AggregationPeriod::Yearly,
            ],
            metrics: vec!["rainfallHourly".to_string()],
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

/// Source of wall-clock time for the triggers.
pub trait WallClock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Stores and lease coordinator every rollup job is wired to.
#[derive(Clone)]
pub struct RollupTargets {
    pub source: Arc<dyn DocumentStore>,
    pub target: Arc<dyn DocumentStore>,
    pub coordinator: Arc<LeaseCoordinator>,
}

/// Converts calendar boundaries into submitted rollup jobs.
pub struct CronTrigger {
    config: TriggerConfig,
    targets: RollupTargets,
    submitter: JobSubmitter,
    clock: Arc<dyn WallClock>,
}

impl CronTrigger {
    pub fn new(config: TriggerConfig, targets: RollupTargets, submitter: JobSubmitter) -> Self {
        Self {
            config,
            targets,
            submitter,
            clock: Arc::new(SystemClock),
        }
    }

    /// Read wall-clock time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Next firing of `period` strictly after `now`.
    pub fn next_firing(
        &self,
        period: AggregationPeriod,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Tz>> {
        period
            .next_boundary(&now.with_timezone(&self.config.timezone))
            .ok_or_else(|| {
                RollupError::new(
                    ErrorCode::InvalidSchedule,
                    format!("no {} boundary after {} in {}", period, now, self.config.timezone),
                )
            })
    }

    /// Build the lease-checked rollup job of `metric` for a firing of
    /// `period` at `now`.
    ///
    /// The job covers `[now - one period, now)`. Its lease key depends only
    /// on the metric and period, and its lease lives for the period's
    /// minimum length minus a safety margin.
    pub fn build_job(
        &self,
        metric: &str,
        period: AggregationPeriod,
        now: DateTime<Utc>,
    ) -> Result<BoxedJob> {
        let local_now = now.with_timezone(&self.config.timezone);
        let from = period.lookback(&local_now).ok_or_else(|| {
            RollupError::new(
                ErrorCode::InvalidSchedule,
                format!("cannot step one {} back from {}", period, local_now),
            )
        })?;

        let pipeline = RollupPipeline::new(metric, period, from.with_timezone(&Utc), now)
            .with_timezone(self.config.timezone)
            .build()?;

        let check = LeaseCheck::new(
            LeaseKey::for_rollup(metric, period),
            period.lease_ttl(),
            self.targets.coordinator.clone(),
        );

        let job = AggregationJob::new(
            self.targets.source.clone(),
            self.targets.target.clone(),
            pipeline,
        )
        .with_lease_check(check)
        .with_timeout(self.config.job_timeout);

        Ok(Box::new(job))
    }

    /// Handle one firing of `period`: submit a job per metric.
    ///
    /// Returns how many jobs were submitted. Never fails; problems with one
    /// metric are logged and do not affect the others.
    pub async fn fire(&self, period: AggregationPeriod, now: DateTime<Utc>) -> usize {
        record_firing(period.as_str());
        info!(
            period = %period,
            fired_at = %now.with_timezone(&self.config.timezone),
            "Rollup trigger fired"
        );

        let mut submitted = 0;
        for metric in &self.config.metrics {
            let job = match self.build_job(metric, period, now) {
                Ok(job) => job,
                Err(e) => {
                    error!(
                        period = %period,
                        metric = %metric,
                        "Failed to build rollup job, abandoning firing"
                    );
                    e.log();
                    continue;
                }
            };

            match self.submitter.submit(job).await {
                Ok(()) => submitted += 1,
                Err(e) => {
                    warn!(
                        period = %period,
                        metric = %metric,
                        error = %e,
                        "Failed to submit rollup job"
                    );
                }
            }
        }
        submitted
    }

    /// Start one trigger task per configured period.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut periods = self.config.periods.clone();
        periods.sort();
        periods.dedup();

        periods
            .into_iter()
            .map(|period| tokio::spawn(self.clone().run_period(period, cancel.clone())))
            .collect()
    }

    async fn run_period(self: Arc<Self>, period: AggregationPeriod, cancel: CancellationToken) {
        info!(period = %period, timezone = %self.config.timezone, "Rollup trigger started");

        let mut next = match self.next_firing(period, self.clock.now()) {
            Ok(next) => next.with_timezone(&Utc),
            Err(e) => {
                error!(
                    period = %period,
                    error = %e,
                    "Cannot compute next firing, stopping trigger"
                );
                return;
            }
        };

        loop {
            debug!(
                period = %period,
                next = %next.with_timezone(&self.config.timezone),
                "Waiting for next firing"
            );
            if !self.sleep_until(next, &cancel).await {
                break;
            }

            // Fire with the scheduled boundary so every replica builds the
            // same time range.
            let fired = tokio::select! {
                _ = cancel.cancelled() => break,
                fired = self.fire(period, next) => fired,
            };
            debug!(period = %period, submitted = fired, "Firing handled");

            next = match self.next_firing(period, next) {
                Ok(following) => following.with_timezone(&Utc),
                Err(e) => {
                    error!(
                        period = %period,
                        error = %e,
                        "Cannot compute next firing, stopping trigger"
                    );
                    break;
                }
            };
        }

        info!(period = %period, "Rollup trigger stopped");
    }

    /// Sleep until the wall clock reads at least `until`.
    ///
    /// Returns `false` when cancelled first.
    async fn sleep_until(&self, until: DateTime<Utc>, cancel: &CancellationToken) -> bool {
        loop {
            let now = self.clock.now();
            let wait = match (until - now).to_std() {
                Ok(wait) if !wait.is_zero() => wait,
                _ => return true,
            };
            debug!(wait_secs = wait.as_secs(), "Sleeping until boundary");

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::{job_queue, JobReceiver};
    use crate::lease::InMemoryLeaseStore;
    use crate::store::InMemoryDocumentStore;
    use chrono::TimeZone;
    use chrono_tz::Australia::Perth;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Replays fixed readings, then repeats the last one.
    struct ScriptedClock {
        readings: Mutex<VecDeque<DateTime<Utc>>>,
    }

    impl ScriptedClock {
        fn new(readings: Vec<DateTime<Utc>>) -> Self {
            Self {
                readings: Mutex::new(readings.into()),
            }
        }
    }

    impl WallClock for ScriptedClock {
        fn now(&self) -> DateTime<Utc> {
            let mut readings = self.readings.lock();
            if readings.len() > 1 {
                readings.pop_front().unwrap()
            } else {
                *readings.front().unwrap()
            }
        }
    }

    /// Wall clock that advances with tokio's clock from `origin`.
    struct TrackingClock {
        origin: DateTime<Utc>,
        started: Instant,
    }

    impl WallClock for TrackingClock {
        fn now(&self) -> DateTime<Utc> {
            self.origin + chrono::Duration::from_std(self.started.elapsed()).unwrap()
        }
    }

    fn daily_trigger(
        clock: Arc<dyn WallClock>,
    ) -> (Arc<CronTrigger>, JobReceiver, Arc<InMemoryDocumentStore>) {
        let (trigger, receiver, source) = trigger(vec!["rain"]);
        let trigger = CronTrigger {
            config: TriggerConfig {
                periods: vec![AggregationPeriod::Daily],
                ..trigger.config
            },
            ..trigger
        }
        .with_clock(clock);
        (Arc::new(trigger), receiver, source)
    }

    fn trigger(metrics: Vec<&str>) -> (CronTrigger, JobReceiver, Arc<InMemoryDocumentStore>) {
        let source = Arc::new(InMemoryDocumentStore::new("readings"));
        let targets = RollupTargets {
            source: source.clone(),
            target: Arc::new(InMemoryDocumentStore::new("rollups")),
            coordinator: Arc::new(LeaseCoordinator::new(
                Arc::new(InMemoryLeaseStore::new()),
                "test",
            )),
        };
        let config = TriggerConfig {
            metrics: metrics.into_iter().map(String::from).collect(),
            ..TriggerConfig::default()
        };
        let (submitter, receiver) = job_queue(16);
        (CronTrigger::new(config, targets, submitter), receiver, source)
    }

    #[test]
    fn test_next_firing_uses_configured_timezone() {
        let (trigger, _rx, _) = trigger(vec!["rain"]);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap();
        let next = trigger.next_firing(AggregationPeriod::Daily, now).unwrap();
        assert_eq!(next, Perth.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_fire_submits_one_job_per_metric() {
        let (trigger, _rx, _) = trigger(vec!["rainfallHourly", "temperature"]);
        let now = Perth.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap().with_timezone(&Utc);

        assert_eq!(trigger.fire(AggregationPeriod::Daily, now).await, 2);
    }

    #[tokio::test]
    async fn test_bad_metric_is_skipped_without_affecting_others() {
        let (trigger, _rx, _) = trigger(vec!["bad.metric", "rain"]);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 16, 0, 0).unwrap();

        assert_eq!(trigger.fire(AggregationPeriod::Daily, now).await, 1);
    }

    #[tokio::test]
    async fn test_fire_after_shutdown_submits_nothing() {
        let (trigger, rx, _) = trigger(vec!["rain"]);
        drop(rx);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 16, 0, 0).unwrap();

        assert_eq!(trigger.fire(AggregationPeriod::Weekly, now).await, 0);
    }

    #[tokio::test]
    async fn test_built_job_covers_one_period_back() {
        let (trigger, _rx, source) = trigger(vec!["rain"]);
        let now = Perth.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap().with_timezone(&Utc);

        let job = trigger.build_job("rain", AggregationPeriod::Monthly, now).unwrap();
        assert_eq!(job.name(), "aggregate:rain-MONTHLY-%Y-%m-01");

        // Readings store is empty, so the run fails after recording its pipeline.
        assert!(job.execute(&crate::jobs::JobContext::detached()).await.is_err());
        let pipeline = &source.pipelines()[0];
        let range = &pipeline[0]["$match"]["timestamp"];
        assert_eq!(range["$gte"]["$date"], serde_json::json!("2025-05-31T16:00:00.000Z"));
        assert_eq!(range["$lt"]["$date"], serde_json::json!("2025-06-30T16:00:00.000Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_waits_for_wall_clock_after_early_wake() {
        let boundary = Perth.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap().with_timezone(&Utc);
        // The wall clock steps back by 8s while the first sleep is pending.
        let clock = ScriptedClock::new(vec![
            boundary - chrono::Duration::seconds(10),
            boundary - chrono::Duration::seconds(10),
            boundary - chrono::Duration::seconds(2),
            boundary,
        ]);
        let (trigger, mut rx, _) = daily_trigger(Arc::new(clock));
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let handles = trigger.spawn(cancel.clone());

        assert!(rx.recv().await.is_some());
        assert!(started.elapsed() >= Duration::from_secs(12));

        // The same boundary is not fired a second time.
        let again = tokio::time::timeout(Duration::from_secs(3600), rx.recv()).await;
        assert!(again.is_err());

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_boundaries_fire_in_order() {
        let boundary = Perth.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap().with_timezone(&Utc);
        let clock = TrackingClock {
            origin: boundary - chrono::Duration::seconds(1),
            started: Instant::now(),
        };
        let (trigger, mut rx, source) = daily_trigger(Arc::new(clock));
        let cancel = CancellationToken::new();
        let handles = trigger.spawn(cancel.clone());

        assert!(rx.recv().await.is_some());
        let second = rx.recv().await.unwrap();

        // Readings store is empty, so the run fails after recording its pipeline.
        assert!(second.execute(&crate::jobs::JobContext::detached()).await.is_err());
        let range = &source.pipelines()[0][0]["$match"]["timestamp"];
        assert_eq!(range["$gte"]["$date"], serde_json::json!("2025-06-01T16:00:00.000Z"));
        assert_eq!(range["$lt"]["$date"], serde_json::json!("2025-06-02T16:00:00.000Z"));

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
