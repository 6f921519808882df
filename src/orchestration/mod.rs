//! # Orchestration Engine
//!
//! Ties the queue, the lifecycle tracker and the retry engine together.
//!
//! ## Core Components
//!
//! - **StageRunner**: drives one leased message to a terminal outcome
//!   (invalid, forwarded, completed, pending, requeued, dead-lettered)
//! - **StageConsumer**: polling loop feeding leased batches to a runner
//! - **Error classification**: the single fatal/retryable decision point
//! - **StageError**: the failure value handlers return

pub mod consumer;
pub mod error_classifier;
pub mod errors;
pub mod stage_runner;

pub use consumer::{ConsumerBatchStats, ConsumerConfig, StageConsumer};
pub use error_classifier::{
    classify, ErrorClassification, ErrorClassifier, ErrorReason, StandardErrorClassifier,
};
pub use errors::{StageError, StageResult};
pub use stage_runner::{
    handler_fn, ContinuationMessage, DeadLetterReason, FnStageHandler, HandlerRetryPolicy,
    StageHandler, StageHandlerContext, StageOutcome, StageRunOutcome, StageRunReport,
    StageRunner, StageRunnerConfig,
};
