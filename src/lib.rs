#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Stage Engine Core
//!
//! Queue-driven execution engine for multi-stage background jobs.
//!
//! ## Overview
//!
//! A job moves through named stages (research, outline, draft, publish...).
//! Each stage is a message on a durable visibility-timeout queue. A
//! [`orchestration::StageRunner`] leases the message, records the attempt in
//! the stage lifecycle store, runs the caller's handler under in-process
//! retries, and then acknowledges, requeues with backoff, or dead-letters it.
//!
//! ## Module Organization
//!
//! - [`retry`] - backoff strategies and the retry executor
//! - [`resilience`] - per-dependency circuit breakers with persisted state
//! - [`messaging`] - the stage queue facade and its backing stores
//! - [`state_machine`] - stage and job lifecycle tracking
//! - [`orchestration`] - error classification, the stage runner and consumer loop
//! - [`events`] - lifecycle events and metrics
//! - [`config`] - YAML configuration with environment overrides
//! - [`logging`] - structured logging initialisation
//! - [`error`] - crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stage_engine::messaging::{InMemoryStageQueueStore, StageQueue};
//! use stage_engine::orchestration::{handler_fn, ConsumerConfig, StageConsumer, StageOutcome, StageRunner};
//! use stage_engine::state_machine::{InMemoryStageLifecycleStore, StageLifecycleTracker};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let queue = StageQueue::new(Arc::new(InMemoryStageQueueStore::new()));
//! let tracker = StageLifecycleTracker::new(Arc::new(InMemoryStageLifecycleStore::new()));
//!
//! let runner = StageRunner::new(
//!     "research",
//!     "stage_jobs",
//!     queue,
//!     tracker,
//!     Arc::new(handler_fn(|ctx| async move {
//!         tracing::info!(job_id = %ctx.job_id, "researching");
//!         Ok(StageOutcome::Complete)
//!     })),
//! );
//!
//! let shutdown = CancellationToken::new();
//! StageConsumer::new(runner, ConsumerConfig::default()).run(shutdown).await;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod resilience;
pub mod retry;
pub mod state_machine;

pub use config::{ConfigManager, ConfigurationError, StageEngineConfig};
pub use error::{StageEngineError, StageEngineResult};
pub use events::{EventSink, StageEvent, StageEventKind, StageEventPublisher};
pub use messaging::{StageMessage, StageQueue, StageQueueStore};
pub use orchestration::{
    handler_fn, StageConsumer, StageError, StageHandler, StageHandlerContext, StageOutcome,
    StageRunOutcome, StageRunReport, StageRunner,
};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use retry::{compute_delay, run_batch, run_with_retry, BackoffStrategy, RetryConfig};
pub use state_machine::{JobStatus, StageLifecycleTracker, StageStatus};
