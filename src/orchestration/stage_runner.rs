//! # Stage Runner
//!
//! Drives one leased stage message to a terminal outcome:
//!
//! 1. **Validate**: a message without a job id is acknowledged and discarded.
//! 2. **Stage match**: a message for another stage is re-enqueued under its
//!    own stage and the original acknowledged.
//! 3. **Begin**: the lifecycle tracker starts an attempt.
//! 4. **Execute**: the handler runs under the retry engine; only failures the
//!    classifier marks retryable are retried in-process.
//! 5. **Success**: `Complete` completes the lifecycle entry and acknowledges;
//!    `Continue` enqueues the continuation, then acknowledges.
//! 6. **Failure**: the lifecycle tracker records the failure, then the message
//!    is dead-lettered (fatal, non-retryable, budget spent) or requeued with
//!    the stage-level backoff. A failed requeue falls back to dead-lettering,
//!    unless the message was already settled through another lease.
//!
//! No message leaves the runner without an acknowledgement or a dead-letter
//! record. When neither can be written the error is returned and the lease
//! expires, so the message is redelivered.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{StageEngineError, StageEngineResult};
use crate::events::{
    EventSink, MetricName, MetricTags, StageEvent, StageEventKind, StageMetric, TracingEventSink,
};
use crate::messaging::{
    DeadLetterRequest, DelayedRequeueOptions, EnqueueOptions, MessageId, QueueError,
    QueueResult, StageMessage, StageQueue,
};
use crate::orchestration::error_classifier::{
    ErrorClassification, ErrorClassifier, StandardErrorClassifier,
};
use crate::orchestration::errors::StageError;
use crate::retry::{run_with_retry, BackoffStrategy, RetryConfig, RetryOptions};
use crate::state_machine::{
    FailureContext, StageFailure, StageLifecycleEntry, StageLifecycleTracker, StageStartContext,
};

/// Follow-up message a handler asks the runner to enqueue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationMessage {
    /// Target stage; may be the current stage
    pub stage: String,
    pub payload: Value,
    #[serde(default)]
    pub options: EnqueueOptions,
    /// Target queue; routed by stage when absent
    #[serde(default)]
    pub queue_name: Option<String>,
}

impl ContinuationMessage {
    pub fn new(stage: impl Into<String>, payload: Value) -> Self {
        Self {
            stage: stage.into(),
            payload,
            options: EnqueueOptions::default(),
            queue_name: None,
        }
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }
}

/// Successful handler result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageOutcome {
    /// The stage is done
    Complete,
    /// More work remains; the runner enqueues the continuation before
    /// acknowledging, without completing the lifecycle entry
    Continue(ContinuationMessage),
}

/// Everything a handler receives for one attempt
#[derive(Debug, Clone)]
pub struct StageHandlerContext {
    pub job_id: Uuid,
    pub stage: String,
    pub payload: Value,
    /// Lifecycle snapshot taken when the attempt started
    pub stage_info: StageLifecycleEntry,
    pub queue_name: String,
    pub msg_id: MessageId,
    pub visibility_seconds: u32,
    pub message: StageMessage,
    pub queue: StageQueue,
    /// 0-based in-process retry attempt
    pub retry_attempt: u32,
}

impl StageHandlerContext {
    /// Push back this message's lease; `false` once the lease is lost
    pub async fn extend_visibility(&self, additional_seconds: u32) -> QueueResult<bool> {
        self.queue
            .extend_visibility(
                &self.queue_name,
                self.msg_id,
                self.job_id,
                &self.stage,
                additional_seconds,
            )
            .await
    }
}

/// Caller-supplied stage logic
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, ctx: StageHandlerContext) -> Result<StageOutcome, StageError>;
}

/// Handler backed by an async closure, see [`handler_fn`]
pub struct FnStageHandler<F> {
    handler: F,
}

impl<F> fmt::Debug for FnStageHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStageHandler").finish_non_exhaustive()
    }
}

/// Wrap an async closure as a [`StageHandler`]
pub fn handler_fn<F, Fut>(handler: F) -> FnStageHandler<F>
where
    F: Fn(StageHandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutcome, StageError>> + Send,
{
    FnStageHandler { handler }
}

#[async_trait]
impl<F, Fut> StageHandler for FnStageHandler<F>
where
    F: Fn(StageHandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutcome, StageError>> + Send,
{
    async fn handle(&self, ctx: StageHandlerContext) -> Result<StageOutcome, StageError> {
        (self.handler)(ctx).await
    }
}

/// Terminal outcome of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRunOutcome {
    Invalid,
    Forwarded,
    Completed,
    Pending,
    Requeued,
    DeadLettered,
}

impl StageRunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Forwarded => "forwarded",
            Self::Completed => "completed",
            Self::Pending => "pending",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for StageRunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Handler raised an explicitly fatal error
    FatalError,
    /// Heuristics found the error non-retryable
    NonRetryableError,
    MaxAttemptsExceeded,
    /// The delayed requeue itself failed
    RequeueFailed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FatalError => "fatal_error",
            Self::NonRetryableError => "non_retryable_error",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::RequeueFailed => "requeue_failed",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRunReport {
    pub outcome: StageRunOutcome,
    pub msg_id: MessageId,
    pub job_id: Option<Uuid>,
    /// Stage embedded in the message
    pub stage: String,
    /// Lifecycle attempt, when one was started
    pub attempt: Option<u32>,
    pub dead_letter_reason: Option<DeadLetterReason>,
    pub dead_letter_id: Option<i64>,
    pub requeued_msg_id: Option<MessageId>,
    pub forwarded_msg_id: Option<MessageId>,
    pub continuation_msg_id: Option<MessageId>,
    pub classification: Option<ErrorClassification>,
}

impl StageRunReport {
    fn new(outcome: StageRunOutcome, message: &StageMessage) -> Self {
        Self {
            outcome,
            msg_id: message.msg_id,
            job_id: message.job_id,
            stage: message.stage.clone(),
            attempt: None,
            dead_letter_reason: None,
            dead_letter_id: None,
            requeued_msg_id: None,
            forwarded_msg_id: None,
            continuation_msg_id: None,
            classification: None,
        }
    }

    fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// How in-process handler retries are derived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerRetryPolicy {
    pub strategy: BackoffStrategy,
    pub factor: f64,
    pub jitter: bool,
    pub max_attempts: u32,
    /// Floor for the derived base delay
    pub min_base_delay_ms: u64,
    /// Derived cap = base × this
    pub cap_multiplier: u64,
    /// Use this configuration as-is instead of deriving one per stage
    pub fixed: Option<RetryConfig>,
}

impl Default for HandlerRetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            factor: 2.0,
            jitter: true,
            max_attempts: 3,
            min_base_delay_ms: 250,
            cap_multiplier: 32,
            fixed: None,
        }
    }
}

impl HandlerRetryPolicy {
    /// Always use `config`
    pub fn fixed(config: RetryConfig) -> Self {
        Self {
            fixed: Some(config),
            ..Self::default()
        }
    }

    /// Retry configuration for an attempt of `entry`: base delay
    /// `max(min_base_delay_ms, retry_delay_seconds × 1000)`, cap 32× base
    pub fn for_stage(&self, entry: &StageLifecycleEntry) -> RetryConfig {
        if let Some(fixed) = &self.fixed {
            return fixed.clone();
        }

        let base = self
            .min_base_delay_ms
            .max(u64::from(entry.retry_delay_seconds).saturating_mul(1_000));
        RetryConfig::exponential(base, base.saturating_mul(self.cap_multiplier.max(1)))
            .with_strategy(self.strategy)
            .with_factor(self.factor)
            .with_jitter(self.jitter)
            .with_max_attempts(self.max_attempts.max(1))
    }
}

/// Runner settings
#[derive(Debug, Clone, PartialEq)]
pub struct StageRunnerConfig {
    /// Lease handed to handlers when the message carries none
    pub visibility_seconds: u32,
    pub handler_retry: HandlerRetryPolicy,
    /// stage → queue for forwarded and continuation messages; unrouted
    /// stages stay on the runner's queue
    pub routes: HashMap<String, String>,
}

impl Default for StageRunnerConfig {
    fn default() -> Self {
        Self {
            visibility_seconds: 300,
            handler_retry: HandlerRetryPolicy::default(),
            routes: HashMap::new(),
        }
    }
}

/// Orchestrates one stage over a queue
#[derive(Clone)]
pub struct StageRunner {
    stage: String,
    queue_name: String,
    queue: StageQueue,
    tracker: StageLifecycleTracker,
    handler: Arc<dyn StageHandler>,
    classifier: Arc<dyn ErrorClassifier>,
    events: Arc<dyn EventSink>,
    config: StageRunnerConfig,
    cancellation: Option<CancellationToken>,
}

impl fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRunner")
            .field("stage", &self.stage)
            .field("queue_name", &self.queue_name)
            .field("classifier", &self.classifier.classifier_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    pub fn new(
        stage: impl Into<String>,
        queue_name: impl Into<String>,
        queue: StageQueue,
        tracker: StageLifecycleTracker,
        handler: Arc<dyn StageHandler>,
    ) -> Self {
        Self {
            stage: stage.into(),
            queue_name: queue_name.into(),
            queue,
            tracker,
            handler,
            classifier: Arc::new(StandardErrorClassifier::new()),
            events: Arc::new(TracingEventSink),
            config: StageRunnerConfig::default(),
            cancellation: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: StageRunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Interrupts in-process handler retries
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn queue(&self) -> &StageQueue {
        &self.queue
    }

    pub fn config(&self) -> &StageRunnerConfig {
        &self.config
    }

    fn queue_for(&self, stage: &str) -> &str {
        self.config
            .routes
            .get(stage)
            .map(String::as_str)
            .unwrap_or(self.queue_name.as_str())
    }

    fn emit(&self, event: StageEvent) {
        if let Err(e) = self.events.emit_event(&event) {
            warn!(event = %event.kind, error = %e, "⚠️ Event sink rejected stage event");
        }
    }

    fn record_metric(&self, name: MetricName, value: f64, tags: &MetricTags) {
        let metric = StageMetric::new(name, value, tags.clone());
        if let Err(e) = self.events.record_metric(&metric) {
            warn!(metric = name.as_str(), error = %e, "⚠️ Event sink rejected stage metric");
        }
    }

    /// Process a batch of leased messages concurrently, one task per message.
    /// Results are returned in input order.
    pub async fn process_stage_batch(
        &self,
        messages: Vec<StageMessage>,
    ) -> Vec<StageEngineResult<StageRunReport>> {
        debug!(
            stage = %self.stage,
            queue_name = %self.queue_name,
            count = messages.len(),
            "Processing stage message batch"
        );
        join_all(
            messages
                .into_iter()
                .map(|message| self.process_stage_message(message)),
        )
        .await
    }

    /// Drive one leased message to a terminal outcome
    pub async fn process_stage_message(
        &self,
        message: StageMessage,
    ) -> StageEngineResult<StageRunReport> {
        let Some(job_id) = message.job_id else {
            warn!(
                queue_name = %self.queue_name,
                msg_id = message.msg_id,
                "⚠️ Discarding stage message without job id"
            );
            self.queue.ack(&self.queue_name, message.msg_id).await?;
            return Ok(StageRunReport::new(StageRunOutcome::Invalid, &message));
        };

        if message.stage != self.stage {
            return self.forward(job_id, message).await;
        }

        let entry = self.begin(job_id, &message).await;
        let tags = MetricTags {
            job_id,
            stage: self.stage.clone(),
            queue_name: self.queue_name.clone(),
            attempt: entry.attempt_count,
            priority: entry.priority,
            queue_latency_ms: message.queue_latency_ms(Utc::now()),
        };
        self.emit(
            StageEvent::new(
                StageEventKind::StageStarted,
                job_id,
                &self.stage,
                &self.queue_name,
                message.msg_id,
            )
            .with_attempt(entry.attempt_count)
            .with_priority(entry.priority)
            .with_details(json!({ "queue_latency_ms": tags.queue_latency_ms })),
        );
        self.record_metric(MetricName::Attempt, 1.0, &tags);

        let started = Instant::now();
        let result = self.execute_handler(job_id, &message, &entry).await;
        self.record_metric(
            MetricName::Duration,
            started.elapsed().as_secs_f64() * 1_000.0,
            &tags,
        );

        match result {
            Ok(StageOutcome::Complete) => self.complete(job_id, message, &entry).await,
            Ok(StageOutcome::Continue(continuation)) => {
                self.continue_with(job_id, message, &entry, continuation)
                    .await
            }
            Err(stage_error) => {
                self.record_metric(MetricName::Failure, 1.0, &tags);
                self.fail(job_id, message, entry, stage_error).await
            }
        }
    }

    async fn forward(
        &self,
        job_id: Uuid,
        message: StageMessage,
    ) -> StageEngineResult<StageRunReport> {
        let target_queue = self.queue_for(&message.stage).to_string();
        let forwarded_msg_id = self
            .queue
            .enqueue(
                &target_queue,
                job_id,
                &message.stage,
                &message.payload,
                &EnqueueOptions::inherited_from(&message),
            )
            .await?;
        self.queue.ack(&self.queue_name, message.msg_id).await?;

        info!(
            job_id = %job_id,
            msg_id = message.msg_id,
            forwarded_msg_id = forwarded_msg_id,
            runner_stage = %self.stage,
            message_stage = %message.stage,
            target_queue = %target_queue,
            "↪️ Forwarded stage message to its own stage"
        );
        self.emit(
            StageEvent::new(
                StageEventKind::StageForwarded,
                job_id,
                &message.stage,
                &self.queue_name,
                message.msg_id,
            )
            .with_details(json!({
                "runner_stage": self.stage,
                "target_queue": target_queue,
                "forwarded_msg_id": forwarded_msg_id,
            })),
        );

        let mut report = StageRunReport::new(StageRunOutcome::Forwarded, &message);
        report.forwarded_msg_id = Some(forwarded_msg_id);
        Ok(report)
    }

    /// Start the lifecycle attempt, synthesizing a snapshot when the store
    /// is unavailable
    async fn begin(&self, job_id: Uuid, message: &StageMessage) -> StageLifecycleEntry {
        let context = StageStartContext {
            max_attempts: message.max_attempts.and_then(|v| u32::try_from(v).ok()),
            retry_delay_seconds: message
                .retry_delay_seconds
                .and_then(|v| u32::try_from(v).ok()),
            priority: Some(message.priority),
        };

        match self.tracker.start_stage(job_id, &self.stage, &context).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    job_id = %job_id,
                    stage = %self.stage,
                    msg_id = message.msg_id,
                    error = %e,
                    "❌ Failed to start stage lifecycle entry, using local snapshot"
                );
                let settings = context.resolve(self.tracker.defaults());
                let mut entry = StageLifecycleEntry::new(job_id, &self.stage, &settings);
                entry.attempt_count = message.delivery_attempt().saturating_sub(1);
                entry.begin_attempt(Utc::now());
                entry
            }
        }
    }

    async fn execute_handler(
        &self,
        job_id: Uuid,
        message: &StageMessage,
        entry: &StageLifecycleEntry,
    ) -> Result<StageOutcome, StageError> {
        let retry_config = self.config.handler_retry.for_stage(entry);
        let visibility_seconds = message
            .visibility_seconds
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(self.config.visibility_seconds);

        let base_context = StageHandlerContext {
            job_id,
            stage: self.stage.clone(),
            payload: message.payload.clone(),
            stage_info: entry.clone(),
            queue_name: self.queue_name.clone(),
            msg_id: message.msg_id,
            visibility_seconds,
            message: message.clone(),
            queue: self.queue.clone(),
            retry_attempt: 0,
        };

        let classifier = Arc::clone(&self.classifier);
        let stage = self.stage.clone();
        let mut options = RetryOptions::new()
            .with_should_retry(move |error: &StageError, _attempt| {
                classifier.classify_error(error).retryable
            })
            .with_on_retry(move |error: &StageError, attempt, delay| {
                debug!(
                    job_id = %job_id,
                    stage = %stage,
                    retry_attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Handler failed, retrying in-process"
                );
            });
        if let Some(token) = &self.cancellation {
            options = options.with_cancellation(token.clone());
        }

        let handler = Arc::clone(&self.handler);
        run_with_retry(
            |attempt| {
                let handler = Arc::clone(&handler);
                let mut ctx = base_context.clone();
                ctx.retry_attempt = attempt;
                async move { handler.handle(ctx).await }
            },
            &retry_config,
            options,
        )
        .await
        .map_err(StageError::from)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        message: StageMessage,
        entry: &StageLifecycleEntry,
    ) -> StageEngineResult<StageRunReport> {
        if let Err(e) = self.tracker.complete_stage(job_id, &self.stage).await {
            error!(
                job_id = %job_id,
                stage = %self.stage,
                error = %e,
                "❌ Failed to record stage completion, acknowledging anyway"
            );
        }
        self.queue.ack(&self.queue_name, message.msg_id).await?;

        self.emit(
            StageEvent::new(
                StageEventKind::StageCompleted,
                job_id,
                &self.stage,
                &self.queue_name,
                message.msg_id,
            )
            .with_attempt(entry.attempt_count)
            .with_priority(entry.priority),
        );
        Ok(StageRunReport::new(StageRunOutcome::Completed, &message).with_attempt(entry.attempt_count))
    }

    async fn continue_with(
        &self,
        job_id: Uuid,
        message: StageMessage,
        entry: &StageLifecycleEntry,
        continuation: ContinuationMessage,
    ) -> StageEngineResult<StageRunReport> {
        let target_queue = continuation
            .queue_name
            .clone()
            .unwrap_or_else(|| self.queue_for(&continuation.stage).to_string());

        let continuation_msg_id = self
            .queue
            .enqueue(
                &target_queue,
                job_id,
                &continuation.stage,
                &continuation.payload,
                &continuation.options,
            )
            .await
            .map_err(|e| {
                error!(
                    job_id = %job_id,
                    stage = %self.stage,
                    msg_id = message.msg_id,
                    error = %e,
                    "❌ Failed to enqueue continuation, leaving message for redelivery"
                );
                StageEngineError::from(e)
            })?;
        self.queue.ack(&self.queue_name, message.msg_id).await?;

        info!(
            job_id = %job_id,
            stage = %self.stage,
            msg_id = message.msg_id,
            continuation_msg_id = continuation_msg_id,
            next_stage = %continuation.stage,
            "⏭️ Stage continued"
        );
        self.emit(
            StageEvent::new(
                StageEventKind::StageContinued,
                job_id,
                &self.stage,
                &self.queue_name,
                message.msg_id,
            )
            .with_attempt(entry.attempt_count)
            .with_priority(entry.priority)
            .with_details(json!({
                "next_stage": continuation.stage,
                "target_queue": target_queue,
                "continuation_msg_id": continuation_msg_id,
            })),
        );

        let mut report =
            StageRunReport::new(StageRunOutcome::Pending, &message).with_attempt(entry.attempt_count);
        report.continuation_msg_id = Some(continuation_msg_id);
        Ok(report)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        message: StageMessage,
        entry: StageLifecycleEntry,
        stage_error: StageError,
    ) -> StageEngineResult<StageRunReport> {
        let classification = self.classifier.classify_error(&stage_error);
        let error_details = stage_error.to_error_details();
        let context = FailureContext {
            fatal: classification.fatal,
        };

        let failure = match self
            .tracker
            .fail_stage(job_id, &self.stage, &error_details, context)
            .await
        {
            Ok(failure) => failure,
            Err(e) => {
                error!(
                    job_id = %job_id,
                    stage = %self.stage,
                    error = %e,
                    "❌ Failed to record stage failure, using local snapshot"
                );
                StageFailure::evaluate(
                    entry,
                    &error_details,
                    context,
                    self.tracker.max_backoff_exponent(),
                    Utc::now(),
                )
            }
        };
        let attempt = failure.entry.attempt_count;

        warn!(
            job_id = %job_id,
            stage = %self.stage,
            msg_id = message.msg_id,
            attempt = attempt,
            max_attempts = failure.entry.max_attempts,
            reason = %classification.reason,
            fatal = classification.fatal,
            error = %stage_error,
            "⚠️ Stage attempt failed"
        );
        self.emit(
            StageEvent::new(
                StageEventKind::StageFailed,
                job_id,
                &self.stage,
                &self.queue_name,
                message.msg_id,
            )
            .with_attempt(attempt)
            .with_priority(failure.entry.priority)
            .with_details(json!({
                "reason": classification.reason,
                "fatal": classification.fatal,
                "will_retry": failure.will_retry,
                "error": error_details,
            })),
        );

        let mut report =
            StageRunReport::new(StageRunOutcome::DeadLettered, &message).with_attempt(attempt);
        report.classification = Some(classification);

        let reason = if classification.fatal || !classification.retryable {
            if classification.tagged {
                DeadLetterReason::FatalError
            } else {
                DeadLetterReason::NonRetryableError
            }
        } else if !failure.will_retry {
            DeadLetterReason::MaxAttemptsExceeded
        } else {
            match self.requeue(job_id, &message, &failure).await {
                Ok(requeued_msg_id) => {
                    self.emit(
                        StageEvent::new(
                            StageEventKind::StageRequeued,
                            job_id,
                            &self.stage,
                            &self.queue_name,
                            message.msg_id,
                        )
                        .with_attempt(attempt)
                        .with_priority(failure.entry.priority)
                        .with_details(json!({
                            "requeued_msg_id": requeued_msg_id,
                            "retry_delay_seconds": failure.retry_delay_seconds,
                            "next_retry_at": failure.next_retry_at,
                        })),
                    );
                    report.outcome = StageRunOutcome::Requeued;
                    report.requeued_msg_id = Some(requeued_msg_id);
                    return Ok(report);
                }
                Err(e @ QueueError::MessageNotFound { .. }) => {
                    warn!(
                        job_id = %job_id,
                        stage = %self.stage,
                        msg_id = message.msg_id,
                        "⚠️ Lease lost before requeue, message was settled elsewhere"
                    );
                    return Err(StageEngineError::from(e));
                }
                Err(e) => {
                    error!(
                        job_id = %job_id,
                        stage = %self.stage,
                        msg_id = message.msg_id,
                        error = %e,
                        "❌ Delayed requeue failed, dead-lettering instead"
                    );
                    DeadLetterReason::RequeueFailed
                }
            }
        };

        let dead_letter_id = self
            .dead_letter(job_id, &message, reason, classification, &error_details, attempt)
            .await?;
        self.emit(
            StageEvent::new(
                StageEventKind::StageDeadLettered,
                job_id,
                &self.stage,
                &self.queue_name,
                message.msg_id,
            )
            .with_attempt(attempt)
            .with_priority(failure.entry.priority)
            .with_details(json!({
                "failure_reason": reason,
                "dead_letter_id": dead_letter_id,
            })),
        );

        report.dead_letter_reason = Some(reason);
        report.dead_letter_id = Some(dead_letter_id);
        Ok(report)
    }

    async fn requeue(
        &self,
        job_id: Uuid,
        message: &StageMessage,
        failure: &StageFailure,
    ) -> QueueResult<MessageId> {
        let options = DelayedRequeueOptions {
            base_delay_seconds: failure.retry_delay_seconds,
            priority_override: Some(failure.entry.priority),
            visibility_seconds: message
                .visibility_seconds
                .and_then(|v| u32::try_from(v).ok()),
        };
        self.queue
            .delayed_requeue(
                &self.queue_name,
                message.msg_id,
                job_id,
                &self.stage,
                &message.payload,
                &options,
            )
            .await
    }

    async fn dead_letter(
        &self,
        job_id: Uuid,
        message: &StageMessage,
        reason: DeadLetterReason,
        classification: ErrorClassification,
        error_details: &Value,
        attempt: u32,
    ) -> StageEngineResult<i64> {
        let request = DeadLetterRequest {
            msg_id: message.msg_id,
            job_id: Some(job_id),
            stage: self.stage.clone(),
            message: message.payload.clone(),
            failure_reason: reason.as_str().to_string(),
            error_details: json!({
                "error": error_details,
                "classification": {
                    "reason": classification.reason,
                    "fatal": classification.fatal,
                    "retryable": classification.retryable,
                },
                "attempt": attempt,
                "read_count": message.read_count,
            }),
            attempt_count: attempt,
        };

        self.queue
            .move_to_dead_letter(&self.queue_name, &request)
            .await
            .map_err(|e| {
                error!(
                    job_id = %job_id,
                    stage = %self.stage,
                    msg_id = message.msg_id,
                    failure_reason = %reason,
                    error = %e,
                    "❌ Failed to dead-letter message, leaving it for redelivery"
                );
                StageEngineError::from(e)
            })
    }
}
