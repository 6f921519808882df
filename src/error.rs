use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::QueueError;
use crate::resilience::CircuitStoreError;
use crate::state_machine::LifecycleError;

/// Crate-level error aggregating every subsystem
#[derive(Error, Debug)]
pub enum StageEngineError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Circuit breaker state error: {0}")]
    CircuitState(#[from] CircuitStoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Orchestration error: {0}")]
    Orchestration(String),
}

impl StageEngineError {
    pub fn orchestration(message: impl Into<String>) -> Self {
        Self::Orchestration(message.into())
    }
}

pub type StageEngineResult<T> = std::result::Result<T, StageEngineError>;
