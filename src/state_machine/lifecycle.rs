//! # Stage Lifecycle Tracker
//!
//! Persisted per-`(job, stage)` state machine: attempt counting, retry budget,
//! stage-level backoff and the denormalized job summary.
//!
//! ```text
//! pending ──start──▶ processing ──complete──▶ completed
//!                      │    ▲
//!                 fail │    │ start (redelivery)
//!                      ▼    │
//!                     error ─┘
//!                      │
//!     budget spent or fatal
//!                      ▼
//!                    failed
//! ```
//!
//! The stage-level backoff (`retry_delay_seconds × 2^min(attempt, 5)`) is
//! separate from the in-process retry engine the runner wraps handlers in.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{LifecycleError, LifecycleResult};
use super::persistence::StageLifecycleStore;
use super::states::{JobStatus, StageStatus};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY_SECONDS: u32 = 60;
pub const DEFAULT_PRIORITY: i32 = 0;
pub const DEFAULT_MAX_BACKOFF_EXPONENT: u32 = 5;

/// Stage-level retry delay: `base × 2^min(attempt, max_exponent)`, saturating
pub fn retry_delay_seconds(base: u32, attempt: u32, max_exponent: u32) -> u32 {
    let exponent = attempt.min(max_exponent).min(31);
    base.saturating_mul(1u32 << exponent)
}

/// Settings a lifecycle entry is created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSettings {
    pub max_attempts: u32,
    pub retry_delay_seconds: u32,
    pub priority: i32,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECONDS,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// Per-call overrides for [`StageLifecycleTracker::start_stage`]
///
/// Overrides only shape a newly created entry; an existing entry keeps the
/// settings it was created with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStartContext {
    pub max_attempts: Option<u32>,
    pub retry_delay_seconds: Option<u32>,
    pub priority: Option<i32>,
}

impl StageStartContext {
    pub fn resolve(&self, defaults: &StageSettings) -> StageSettings {
        StageSettings {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            retry_delay_seconds: self
                .retry_delay_seconds
                .unwrap_or(defaults.retry_delay_seconds),
            priority: self.priority.unwrap_or(defaults.priority),
        }
    }
}

/// Context for [`StageLifecycleTracker::fail_stage`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureContext {
    /// Classified fatal: the entry becomes `failed` regardless of budget
    pub fatal: bool,
}

impl FailureContext {
    pub fn fatal() -> Self {
        Self { fatal: true }
    }

    pub fn retryable() -> Self {
        Self { fatal: false }
    }
}

/// Persisted lifecycle record of one `(job, stage)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLifecycleEntry {
    pub job_id: Uuid,
    pub stage: String,
    /// Incremented exactly once per start
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub retry_delay_seconds: u32,
    pub priority: i32,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Serialized error of the last failed attempt
    pub last_error: Option<Value>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageLifecycleEntry {
    /// A not-yet-started entry
    pub fn new(job_id: Uuid, stage: impl Into<String>, settings: &StageSettings) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            stage: stage.into(),
            attempt_count: 0,
            max_attempts: settings.max_attempts,
            retry_delay_seconds: settings.retry_delay_seconds,
            priority: settings.priority,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply the start transition in place
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.status = StageStatus::Processing;
        self.started_at = Some(now);
        self.finished_at = None;
        self.last_error = None;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Denormalized job summary maintained as a side effect of stage transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied to a [`JobSummary`]; `None` fields are kept
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn new(job_id: Uuid, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            current_stage: None,
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.current_stage = Some(stage.into());
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.failed_at = Some(at);
        self
    }

    /// Apply this update to an existing summary, or create one
    pub fn apply(&self, existing: Option<JobSummary>, now: DateTime<Utc>) -> JobSummary {
        let mut summary = existing.unwrap_or_else(|| JobSummary {
            job_id: self.job_id,
            status: JobStatus::Queued,
            current_stage: None,
            last_completed_at: None,
            last_failed_at: None,
            updated_at: now,
        });
        summary.status = self.status;
        if let Some(stage) = &self.current_stage {
            summary.current_stage = Some(stage.clone());
        }
        if self.completed_at.is_some() {
            summary.last_completed_at = self.completed_at;
        }
        if self.failed_at.is_some() {
            summary.last_failed_at = self.failed_at;
        }
        summary.updated_at = now;
        summary
    }
}

/// Result of recording a failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Entry after the failure was applied
    pub entry: StageLifecycleEntry,
    /// `false` when the budget is spent or the failure was fatal
    pub will_retry: bool,
    pub next_retry_at: DateTime<Utc>,
    pub retry_delay_seconds: u32,
}

impl StageFailure {
    /// Apply a failure to an entry snapshot. Used by the tracker and by the
    /// runner when the lifecycle store cannot record the failure.
    pub fn evaluate(
        mut entry: StageLifecycleEntry,
        error: &Value,
        context: FailureContext,
        max_backoff_exponent: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = retry_delay_seconds(
            entry.retry_delay_seconds,
            entry.attempt_count,
            max_backoff_exponent,
        );
        let next_retry_at = now + Duration::seconds(i64::from(delay));
        let will_retry = !context.fatal && !entry.attempts_exhausted();

        entry.status = if will_retry {
            StageStatus::Error
        } else {
            StageStatus::Failed
        };
        entry.last_error = Some(error.clone());
        entry.next_retry_at = will_retry.then_some(next_retry_at);
        entry.finished_at = (!will_retry).then_some(now);
        entry.updated_at = now;

        Self {
            entry,
            will_retry,
            next_retry_at,
            retry_delay_seconds: delay,
        }
    }
}

/// Every stage of a job plus its summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job: Option<JobSummary>,
    /// Ordered by stage name
    pub stages: Vec<StageLifecycleEntry>,
}

/// Stage lifecycle tracker over a [`StageLifecycleStore`]
#[derive(Debug, Clone)]
pub struct StageLifecycleTracker {
    store: Arc<dyn StageLifecycleStore>,
    defaults: StageSettings,
    max_backoff_exponent: u32,
}

impl StageLifecycleTracker {
    pub fn new(store: Arc<dyn StageLifecycleStore>) -> Self {
        Self {
            store,
            defaults: StageSettings::default(),
            max_backoff_exponent: DEFAULT_MAX_BACKOFF_EXPONENT,
        }
    }

    pub fn with_defaults(mut self, defaults: StageSettings) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_max_backoff_exponent(mut self, max_backoff_exponent: u32) -> Self {
        self.max_backoff_exponent = max_backoff_exponent;
        self
    }

    pub fn defaults(&self) -> &StageSettings {
        &self.defaults
    }

    pub fn max_backoff_exponent(&self) -> u32 {
        self.max_backoff_exponent
    }

    /// Begin an attempt: increments `attempt_count` and marks the entry
    /// `processing`. The only place the attempt count grows.
    pub async fn start_stage(
        &self,
        job_id: Uuid,
        stage: &str,
        context: &StageStartContext,
    ) -> LifecycleResult<StageLifecycleEntry> {
        let settings = context.resolve(&self.defaults);
        let entry = self.store.begin_attempt(job_id, stage, &settings).await?;

        self.store
            .update_job(&JobUpdate::new(job_id, JobStatus::Processing).with_stage(stage))
            .await?;

        info!(
            job_id = %job_id,
            stage = %stage,
            attempt = entry.attempt_count,
            max_attempts = entry.max_attempts,
            "▶️ Stage attempt started"
        );
        Ok(entry)
    }

    /// Mark a stage completed and stamp the job's `last_completed_at`
    pub async fn complete_stage(
        &self,
        job_id: Uuid,
        stage: &str,
    ) -> LifecycleResult<StageLifecycleEntry> {
        let mut entry = self
            .store
            .load_stage(job_id, stage)
            .await?
            .ok_or_else(|| LifecycleError::stage_not_found(job_id, stage))?;

        let now = Utc::now();
        entry.status = StageStatus::Completed;
        entry.finished_at = Some(now);
        entry.next_retry_at = None;
        entry.last_error = None;
        entry.updated_at = now;
        self.store.save_stage(&entry).await?;

        self.store
            .update_job(
                &JobUpdate::new(job_id, JobStatus::Processing)
                    .with_stage(stage)
                    .completed_at(now),
            )
            .await?;

        info!(
            job_id = %job_id,
            stage = %stage,
            attempt = entry.attempt_count,
            "✅ Stage completed"
        );
        Ok(entry)
    }

    /// Record a failed attempt and compute the stage-level retry schedule
    pub async fn fail_stage(
        &self,
        job_id: Uuid,
        stage: &str,
        error: &Value,
        context: FailureContext,
    ) -> LifecycleResult<StageFailure> {
        let entry = self
            .store
            .load_stage(job_id, stage)
            .await?
            .ok_or_else(|| LifecycleError::stage_not_found(job_id, stage))?;

        let now = Utc::now();
        let failure =
            StageFailure::evaluate(entry, error, context, self.max_backoff_exponent, now);
        self.store.save_stage(&failure.entry).await?;

        let job_status = if failure.will_retry {
            JobStatus::Error
        } else {
            JobStatus::Failed
        };
        self.store
            .update_job(
                &JobUpdate::new(job_id, job_status)
                    .with_stage(stage)
                    .failed_at(now),
            )
            .await?;

        if failure.will_retry {
            debug!(
                job_id = %job_id,
                stage = %stage,
                attempt = failure.entry.attempt_count,
                retry_delay_seconds = failure.retry_delay_seconds,
                "Stage attempt failed, retry scheduled"
            );
        } else {
            warn!(
                job_id = %job_id,
                stage = %stage,
                attempt = failure.entry.attempt_count,
                max_attempts = failure.entry.max_attempts,
                fatal = context.fatal,
                "❌ Stage failed permanently"
            );
        }
        Ok(failure)
    }

    /// `attempt_count >= max_attempts`; `false` for unknown entries
    pub async fn should_dead_letter(&self, job_id: Uuid, stage: &str) -> LifecycleResult<bool> {
        Ok(self
            .store
            .load_stage(job_id, stage)
            .await?
            .is_some_and(|entry| entry.attempts_exhausted()))
    }

    /// Every stage entry of a job, ordered by stage name, with the job summary
    pub async fn stage_progress(&self, job_id: Uuid) -> LifecycleResult<JobProgress> {
        let mut stages = self.store.list_stages(job_id).await?;
        stages.sort_by(|a, b| a.stage.cmp(&b.stage));
        let job = self.store.load_job(job_id).await?;
        Ok(JobProgress { job, stages })
    }
}
