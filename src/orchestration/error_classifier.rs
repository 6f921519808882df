//! # Stage Error Classification
//!
//! Maps a [`StageError`] to a `{fatal, retryable, reason}` decision. This is the
//! single decision point the stage runner consults when choosing between
//! requeue and dead-letter, and the `should_retry` gate for in-process retries.
//!
//! ## Decision order
//!
//! 1. Explicit tags: [`StageError::Fatal`] and [`StageError::Retryable`].
//! 2. Retry aggregates: cancellation is retryable, otherwise the last
//!    collected failure is classified in its place.
//! 3. Cancellation and circuit-open rejections are retryable.
//! 4. Heuristics: error codes (`ETIMEDOUT`, `ECONNREFUSED`, ...), HTTP 429 and
//!    5xx, then message text across the whole cause chain.
//! 5. Anything else is non-retryable and therefore fatal.
//!
//! `fatal == !retryable` holds for every classification.
//!
//! ## Usage
//!
//! ```rust
//! use stage_engine::orchestration::error_classifier::{classify, ErrorReason};
//! use stage_engine::orchestration::StageError;
//!
//! let classification = classify(&StageError::failure("upstream request timeout"));
//! assert!(classification.retryable);
//! assert_eq!(classification.reason, ErrorReason::Timeout);
//! ```

use crate::orchestration::errors::StageError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an error was classified the way it was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    ExplicitFatal,
    ExplicitRetryable,
    Http429,
    Http5xx,
    Timeout,
    NetworkError,
    RateLimited,
    TemporarilyUnavailable,
    CircuitOpen,
    Cancelled,
    NonRetryable,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitFatal => "explicit_fatal",
            Self::ExplicitRetryable => "explicit_retryable",
            Self::Http429 => "http_429",
            Self::Http5xx => "http_5xx",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::RateLimited => "rate_limited",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::NonRetryable => "non_retryable",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a stage error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub fatal: bool,
    pub retryable: bool,
    pub reason: ErrorReason,

    /// Whether the decision came from an explicit tag rather than heuristics
    pub tagged: bool,
}

impl ErrorClassification {
    fn retryable(reason: ErrorReason) -> Self {
        Self {
            fatal: false,
            retryable: true,
            reason,
            tagged: reason == ErrorReason::ExplicitRetryable,
        }
    }

    fn fatal(reason: ErrorReason) -> Self {
        Self {
            fatal: true,
            retryable: false,
            reason,
            tagged: reason == ErrorReason::ExplicitFatal,
        }
    }
}

/// Network error codes and the reason each maps to
const NETWORK_ERROR_CODES: &[(&str, ErrorReason)] = &[
    ("ETIMEDOUT", ErrorReason::Timeout),
    ("ECONNREFUSED", ErrorReason::NetworkError),
    ("ECONNRESET", ErrorReason::NetworkError),
    ("ENOTFOUND", ErrorReason::NetworkError),
    ("EAI_AGAIN", ErrorReason::NetworkError),
];

/// Lower-cased message fragments, checked in order
const MESSAGE_PATTERNS: &[(&str, ErrorReason)] = &[
    ("timeout", ErrorReason::Timeout),
    ("timed out", ErrorReason::Timeout),
    ("etimedout", ErrorReason::Timeout),
    ("econnrefused", ErrorReason::NetworkError),
    ("econnreset", ErrorReason::NetworkError),
    ("enotfound", ErrorReason::NetworkError),
    ("eai_again", ErrorReason::NetworkError),
    ("connection refused", ErrorReason::NetworkError),
    ("connection reset", ErrorReason::NetworkError),
    ("socket hang up", ErrorReason::NetworkError),
    ("dns lookup", ErrorReason::NetworkError),
    ("dns resolution", ErrorReason::NetworkError),
    ("getaddrinfo", ErrorReason::NetworkError),
    ("name resolution", ErrorReason::NetworkError),
    ("rate limit", ErrorReason::RateLimited),
    ("rate-limit", ErrorReason::RateLimited),
    ("too many requests", ErrorReason::RateLimited),
    ("temporarily unavailable", ErrorReason::TemporarilyUnavailable),
    ("service unavailable", ErrorReason::TemporarilyUnavailable),
];

/// Classify a stage error
pub fn classify(error: &StageError) -> ErrorClassification {
    match error {
        StageError::Fatal { .. } => ErrorClassification::fatal(ErrorReason::ExplicitFatal),
        StageError::Retryable { .. } => {
            ErrorClassification::retryable(ErrorReason::ExplicitRetryable)
        }
        StageError::Retry(retry) => {
            if retry.is_cancelled() {
                return ErrorClassification::retryable(ErrorReason::Cancelled);
            }
            match retry.last_failure() {
                Some(last) => classify(last),
                None => ErrorClassification::fatal(ErrorReason::NonRetryable),
            }
        }
        StageError::Cancelled => ErrorClassification::retryable(ErrorReason::Cancelled),
        StageError::CircuitOpen { .. } => {
            ErrorClassification::retryable(ErrorReason::CircuitOpen)
        }
        StageError::Network { code, message } => code
            .as_deref()
            .and_then(reason_for_code)
            .or_else(|| reason_for_message(message))
            .map(ErrorClassification::retryable)
            .unwrap_or_else(|| ErrorClassification::retryable(ErrorReason::NetworkError)),
        StageError::Http { status, message } => reason_for_status(*status)
            .or_else(|| reason_for_message(message))
            .map(ErrorClassification::retryable)
            .unwrap_or_else(|| ErrorClassification::fatal(ErrorReason::NonRetryable)),
        StageError::Failure {
            message,
            code,
            causes,
            ..
        } => code
            .as_deref()
            .and_then(reason_for_code)
            .or_else(|| reason_for_message(message))
            .or_else(|| causes.iter().find_map(|cause| reason_for_message(cause)))
            .map(ErrorClassification::retryable)
            .unwrap_or_else(|| ErrorClassification::fatal(ErrorReason::NonRetryable)),
    }
}

fn reason_for_code(code: &str) -> Option<ErrorReason> {
    NETWORK_ERROR_CODES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(code))
        .map(|(_, reason)| *reason)
}

fn reason_for_status(status: u16) -> Option<ErrorReason> {
    match status {
        429 => Some(ErrorReason::Http429),
        500..=599 => Some(ErrorReason::Http5xx),
        _ => None,
    }
}

fn reason_for_message(message: &str) -> Option<ErrorReason> {
    let lowered = message.to_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(pattern, _)| lowered.contains(pattern))
        .map(|(_, reason)| *reason)
}

/// Pluggable classification strategy used by the stage runner
pub trait ErrorClassifier: Send + Sync {
    fn classify_error(&self, error: &StageError) -> ErrorClassification;

    fn classifier_name(&self) -> &'static str;
}

/// Classifier applying [`classify`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardErrorClassifier;

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify_error(&self, error: &StageError) -> ErrorClassification {
        classify(error)
    }

    fn classifier_name(&self) -> &'static str {
        "standard"
    }
}
