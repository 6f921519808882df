//! # Stage Consumer
//!
//! Polling loop that leases batches from a queue and hands them to a
//! [`StageRunner`]. Queue errors never stop the loop; only shutdown does.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::StageEngineResult;
use crate::logging::log_stage_operation;
use crate::orchestration::stage_runner::{StageRunOutcome, StageRunner};

/// Polling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub visibility_seconds: u32,
    pub batch_size: u32,
    pub poll_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            visibility_seconds: 300,
            batch_size: 5,
            poll_interval_ms: 1_000,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Per-batch tally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerBatchStats {
    pub leased: usize,
    pub completed: usize,
    pub pending: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub forwarded: usize,
    pub invalid: usize,
    /// Messages left for redelivery because a queue write failed
    pub errors: usize,
}

impl ConsumerBatchStats {
    fn record(&mut self, outcome: StageRunOutcome) {
        match outcome {
            StageRunOutcome::Completed => self.completed += 1,
            StageRunOutcome::Pending => self.pending += 1,
            StageRunOutcome::Requeued => self.requeued += 1,
            StageRunOutcome::DeadLettered => self.dead_lettered += 1,
            StageRunOutcome::Forwarded => self.forwarded += 1,
            StageRunOutcome::Invalid => self.invalid += 1,
        }
    }
}

/// Consumer bound to one runner and its queue
#[derive(Debug, Clone)]
pub struct StageConsumer {
    runner: StageRunner,
    config: ConsumerConfig,
}

impl StageConsumer {
    pub fn new(runner: StageRunner, config: ConsumerConfig) -> Self {
        Self { runner, config }
    }

    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    /// Lease and process a single batch
    pub async fn run_once(&self) -> StageEngineResult<ConsumerBatchStats> {
        let messages = self
            .runner
            .queue()
            .dequeue_batch(
                self.runner.queue_name(),
                self.config.visibility_seconds,
                self.config.batch_size.max(1),
            )
            .await?;

        let mut stats = ConsumerBatchStats {
            leased: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            return Ok(stats);
        }

        for result in self.runner.process_stage_batch(messages).await {
            match result {
                Ok(report) => stats.record(report.outcome),
                Err(e) => {
                    stats.errors += 1;
                    error!(
                        queue_name = %self.runner.queue_name(),
                        error = %e,
                        "❌ Stage message left for redelivery"
                    );
                }
            }
        }

        debug!(
            queue_name = %self.runner.queue_name(),
            stage = %self.runner.stage(),
            leased = stats.leased,
            completed = stats.completed,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Stage batch processed"
        );
        Ok(stats)
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let settings = format!(
            "batch_size={} poll_interval_ms={} visibility_seconds={}",
            self.config.batch_size, self.config.poll_interval_ms, self.config.visibility_seconds
        );
        log_stage_operation(
            "consume",
            None,
            Some(self.runner.stage()),
            Some(self.runner.queue_name()),
            "started",
            Some(&settings),
        );

        while !shutdown.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(stats) => stats.leased == 0,
                Err(e) => {
                    warn!(
                        queue_name = %self.runner.queue_name(),
                        error = %e,
                        "⚠️ Failed to lease stage messages, backing off"
                    );
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        }

        log_stage_operation(
            "consume",
            None,
            Some(self.runner.stage()),
            Some(self.runner.queue_name()),
            "stopped",
            None,
        );
    }
}
