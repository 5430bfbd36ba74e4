//! Process-level wiring of triggers, accumulator and worker pool.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::jobs::{
    job_queue, AccumulatorExit, BatchAccumulator, CronTrigger, JobSubmitter, RollupTargets,
    TriggerConfig, WorkerPool,
};

/// Starts the rollup machinery on the current tokio runtime.
pub struct RollupRuntime;

impl RollupRuntime {
    /// Validate `config`, then spawn the accumulator and one trigger task per
    /// configured period.
    ///
    /// Cancelling `shutdown` stops the triggers and the accumulator; jobs
    /// still buffered are dropped and a batch already running finishes.
    pub fn spawn(
        config: &SchedulerConfig,
        targets: RollupTargets,
        shutdown: CancellationToken,
    ) -> Result<RollupHandle> {
        config.validate()?;
        let trigger_config = TriggerConfig {
            timezone: config.timezone()?,
            periods: config.periods.clone(),
            metrics: config.metrics.clone(),
            job_timeout: config.job_timeout,
        };

        let (submitter, receiver) = job_queue(config.queue_capacity);
        let accumulator = BatchAccumulator::new(config.batch_config());
        let pool = WorkerPool::new(config.pool_config());

        let accumulator_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                accumulator
                    .run(
                        receiver,
                        move |batch, workers| {
                            let pool = pool.clone();
                            async move {
                                pool.run(batch, workers).await;
                            }
                        },
                        shutdown,
                    )
                    .await
            }
        });

        let trigger = Arc::new(CronTrigger::new(trigger_config, targets, submitter.clone()));
        let triggers = trigger.spawn(shutdown.clone());

        info!(
            timezone = %config.timezone,
            periods = ?config.periods,
            metrics = ?config.metrics,
            "Rollup runtime started"
        );

        Ok(RollupHandle {
            submitter,
            shutdown,
            accumulator: accumulator_task,
            triggers,
        })
    }
}

/// Handle to a running [`RollupRuntime`].
pub struct RollupHandle {
    submitter: JobSubmitter,
    shutdown: CancellationToken,
    accumulator: JoinHandle<AccumulatorExit>,
    triggers: Vec<JoinHandle<()>>,
}

impl RollupHandle {
    /// Submitter feeding the same accumulator as the triggers.
    pub fn submitter(&self) -> JobSubmitter {
        self.submitter.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel everything and wait for the tasks to stop.
    pub async fn join(self) -> AccumulatorExit {
        self.shutdown.cancel();
        drop(self.submitter);

        for trigger in self.triggers {
            if let Err(e) = trigger.await {
                warn!(error = %e, "Rollup trigger task failed");
            }
        }

        match self.accumulator.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(error = %e, "Accumulator task failed");
                AccumulatorExit::Cancelled { dropped: 0 }
            }
        }
    }
}
