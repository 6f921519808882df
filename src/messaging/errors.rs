//! # Queue Error Types
//!
//! Structured errors for the stage queue and its backing stores. Backing-store
//! failures propagate to the caller unchanged.

use thiserror::Error;

/// Stage queue error types
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("Database query error: {operation}: {message}")]
    DatabaseQuery { operation: String, message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Message not found: {queue_name}: msg_id {msg_id}")]
    MessageNotFound { queue_name: String, msg_id: i64 },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Invalid queue name: {queue_name}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Invalid queue request: {operation}: {reason}")]
    InvalidRequest { operation: String, reason: String },

    #[error("Network timeout: operation {operation} timed out after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Connection pool exhausted: {message}")]
    PoolExhausted { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },
}

impl QueueError {
    /// Create a database connection error
    pub fn database_connection(message: impl Into<String>) -> Self {
        Self::DatabaseConnection {
            message: message.into(),
        }
    }

    /// Create a database query error
    pub fn database_query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DatabaseQuery {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// The message is no longer live, usually because its lease expired and
    /// another consumer settled it
    pub fn message_not_found(queue_name: impl Into<String>, msg_id: i64) -> Self {
        Self::MessageNotFound {
            queue_name: queue_name.into(),
            msg_id,
        }
    }

    pub fn invalid_queue_name(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Conversion from sqlx::Error to QueueError
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => QueueError::database_query("query", "No rows found"),
            sqlx::Error::Database(db_err) => {
                QueueError::database_query("database", db_err.to_string())
            }
            sqlx::Error::PoolTimedOut => QueueError::timeout("database_pool", 30),
            sqlx::Error::PoolClosed => QueueError::PoolExhausted {
                message: "Database pool is closed".to_string(),
            },
            sqlx::Error::Configuration(config_err) => {
                QueueError::configuration("database", config_err.to_string())
            }
            _ => QueueError::database_connection(err.to_string()),
        }
    }
}

/// Conversion from serde_json::Error to QueueError
impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() {
            QueueError::MessageDeserialization {
                message: err.to_string(),
            }
        } else {
            QueueError::MessageSerialization {
                message: err.to_string(),
            }
        }
    }
}

/// Result type alias for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
