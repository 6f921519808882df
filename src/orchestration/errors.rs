//! # Stage Handler Errors
//!
//! `StageError` is the failure value a stage handler returns. Fatal and
//! retryable failures are explicit tags chosen by the handler; everything else
//! (HTTP, network, generic failures) is classified by content in
//! [`crate::orchestration::error_classifier`].

use crate::messaging::QueueError;
use crate::resilience::CircuitBreakerError;
use crate::retry::RetryError;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Failure raised by a stage handler
#[derive(Debug, Error)]
pub enum StageError {
    /// Caller-raised failure that must never be retried
    #[error("{message}")]
    Fatal {
        message: String,
        code: Option<String>,
        metadata: Map<String, Value>,
    },

    /// Caller-raised transient failure
    #[error("{message}")]
    Retryable {
        message: String,
        code: Option<String>,
        metadata: Map<String, Value>,
    },

    /// Upstream answered with a non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Transport-level failure (timeouts, refused connections, DNS)
    #[error("{message}")]
    Network {
        message: String,
        code: Option<String>,
    },

    /// A protected dependency is currently unavailable
    #[error("Circuit breaker open for {dependency}: {message}")]
    CircuitOpen { dependency: String, message: String },

    /// Any other failure, with its cause chain
    #[error("{message}")]
    Failure {
        name: String,
        message: String,
        code: Option<String>,
        causes: Vec<String>,
        metadata: Map<String, Value>,
    },

    /// In-process retries gave up
    #[error("{0}")]
    Retry(RetryError<StageError>),

    /// Execution was cancelled before completion
    #[error("Stage execution cancelled")]
    Cancelled,
}

impl StageError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            code: None,
            metadata: Map::new(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            code: None,
            metadata: Map::new(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn network(code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            code: code.map(str::to_string),
        }
    }

    pub fn circuit_open(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CircuitOpen {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Generic failure named `Error`
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            name: "Error".to_string(),
            message: message.into(),
            code: None,
            causes: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Attach an error code (ignored by variants without one)
    pub fn with_code(mut self, new_code: impl Into<String>) -> Self {
        match &mut self {
            Self::Fatal { code, .. }
            | Self::Retryable { code, .. }
            | Self::Network { code, .. }
            | Self::Failure { code, .. } => *code = Some(new_code.into()),
            _ => {}
        }
        self
    }

    /// Attach a metadata entry (ignored by variants without metadata)
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        match &mut self {
            Self::Fatal { metadata, .. }
            | Self::Retryable { metadata, .. }
            | Self::Failure { metadata, .. } => {
                metadata.insert(key.into(), value.into());
            }
            _ => {}
        }
        self
    }

    /// Append a cause to a generic failure's chain
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        if let Self::Failure { causes, .. } = &mut self {
            causes.push(cause.into());
        }
        self
    }

    /// Error type name recorded in serialized details
    pub fn name(&self) -> &str {
        match self {
            Self::Fatal { .. } => "FatalError",
            Self::Retryable { .. } => "RetryableError",
            Self::Http { .. } => "HttpError",
            Self::Network { .. } => "NetworkError",
            Self::CircuitOpen { .. } => "CircuitOpenError",
            Self::Failure { name, .. } => name,
            Self::Retry(_) => "RetryError",
            Self::Cancelled => "CancelledError",
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Fatal { code, .. }
            | Self::Retryable { code, .. }
            | Self::Network { code, .. }
            | Self::Failure { code, .. } => code.as_deref(),
            Self::CircuitOpen { .. } => Some("CIRCUIT_OPEN"),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn causes(&self) -> &[String] {
        match self {
            Self::Failure { causes, .. } => causes,
            _ => &[],
        }
    }

    pub fn is_fatal_tag(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// JSON serialization stored on lifecycle entries and dead-letter records
    pub fn to_error_details(&self) -> Value {
        let mut details = Map::new();
        details.insert("name".to_string(), json!(self.name()));
        details.insert("message".to_string(), json!(self.to_string()));

        if let Some(code) = self.code() {
            details.insert("code".to_string(), json!(code));
        }
        if let Some(status) = self.status() {
            details.insert("status".to_string(), json!(status));
        }
        if !self.causes().is_empty() {
            details.insert("cause".to_string(), json!(self.causes()));
        }

        match self {
            Self::Fatal { metadata, .. }
            | Self::Retryable { metadata, .. }
            | Self::Failure { metadata, .. }
                if !metadata.is_empty() =>
            {
                details.insert("metadata".to_string(), Value::Object(metadata.clone()));
            }
            Self::CircuitOpen { dependency, .. } => {
                details.insert("metadata".to_string(), json!({ "dependency": dependency }));
            }
            Self::Retry(retry) => {
                details.insert("kind".to_string(), json!(retry.kind()));
                details.insert("attempts".to_string(), json!(retry.attempts()));
                let failures: Vec<Value> = retry
                    .failures()
                    .iter()
                    .map(StageError::to_error_details)
                    .collect();
                details.insert("failures".to_string(), Value::Array(failures));
            }
            _ => {}
        }

        Value::Object(details)
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<StageError>() {
            Ok(stage_error) => return stage_error,
            Err(err) => err,
        };

        let causes = err.chain().skip(1).map(ToString::to_string).collect();
        Self::Failure {
            name: "Error".to_string(),
            message: err.to_string(),
            code: None,
            causes,
            metadata: Map::new(),
        }
    }
}

impl From<RetryError<StageError>> for StageError {
    fn from(err: RetryError<StageError>) -> Self {
        if err.is_cancelled() && err.failures().is_empty() {
            return Self::Cancelled;
        }
        Self::Retry(err)
    }
}

impl From<QueueError> for StageError {
    fn from(err: QueueError) -> Self {
        Self::Failure {
            name: "QueueError".to_string(),
            message: err.to_string(),
            code: None,
            causes: Vec::new(),
            metadata: Map::new(),
        }
    }
}

impl From<CircuitBreakerError<StageError>> for StageError {
    fn from(err: CircuitBreakerError<StageError>) -> Self {
        match err {
            CircuitBreakerError::OperationFailed(inner) => inner,
            CircuitBreakerError::CircuitOpen { ref dependency, .. }
            | CircuitBreakerError::QuotaExhausted { ref dependency, .. } => Self::CircuitOpen {
                dependency: dependency.clone(),
                message: err.to_string(),
            },
        }
    }
}

/// Result type alias for stage handlers
pub type StageResult<T> = Result<T, StageError>;
