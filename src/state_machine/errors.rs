use thiserror::Error;
use uuid::Uuid;

/// Errors raised by lifecycle persistence
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Lifecycle store error: {0}")]
    Database(String),

    #[error("Stage lifecycle entry not found: job {job_id}, stage {stage}")]
    StageNotFound { job_id: Uuid, stage: String },

    #[error("Invalid lifecycle record for job {job_id}, stage {stage}: {message}")]
    InvalidRecord {
        job_id: Uuid,
        stage: String,
        message: String,
    },

    #[error("Lifecycle serialization error: {0}")]
    Serialization(String),
}

impl LifecycleError {
    pub fn stage_not_found(job_id: Uuid, stage: impl Into<String>) -> Self {
        Self::StageNotFound {
            job_id,
            stage: stage.into(),
        }
    }

    pub fn invalid_record(job_id: Uuid, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            job_id,
            stage: stage.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for LifecycleError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for LifecycleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
