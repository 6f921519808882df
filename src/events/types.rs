use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::messaging::MessageId;

/// Lifecycle event kinds emitted by the stage runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEventKind {
    StageStarted,
    StageCompleted,
    StageFailed,
    StageRequeued,
    StageDeadLettered,
    StageForwarded,
    StageContinued,
}

impl StageEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::StageRequeued => "stage_requeued",
            Self::StageDeadLettered => "stage_dead_lettered",
            Self::StageForwarded => "stage_forwarded",
            Self::StageContinued => "stage_continued",
        }
    }
}

impl fmt::Display for StageEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub kind: StageEventKind,
    pub job_id: Uuid,
    pub stage: String,
    pub attempt: Option<u32>,
    pub priority: Option<i32>,
    pub queue_name: String,
    pub msg_id: MessageId,
    pub details: Value,
    pub occurred_at: DateTime<Utc>,
}

impl StageEvent {
    pub fn new(
        kind: StageEventKind,
        job_id: Uuid,
        stage: impl Into<String>,
        queue_name: impl Into<String>,
        msg_id: MessageId,
    ) -> Self {
        Self {
            kind,
            job_id,
            stage: stage.into(),
            attempt: None,
            priority: None,
            queue_name: queue_name.into(),
            msg_id,
            details: Value::Null,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Numeric metric names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    /// One per started attempt, value 1
    Attempt,
    /// Handler wall time in milliseconds
    Duration,
    /// One per failed attempt, value 1
    Failure,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attempt => "attempt",
            Self::Duration => "duration",
            Self::Failure => "failure",
        }
    }
}

/// Tags attached to every metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTags {
    pub job_id: Uuid,
    pub stage: String,
    pub queue_name: String,
    pub attempt: u32,
    pub priority: i32,
    pub queue_latency_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetric {
    pub name: MetricName,
    pub value: f64,
    pub tags: MetricTags,
    pub recorded_at: DateTime<Utc>,
}

impl StageMetric {
    pub fn new(name: MetricName, value: f64, tags: MetricTags) -> Self {
        Self {
            name,
            value,
            tags,
            recorded_at: Utc::now(),
        }
    }
}

/// Anything a sink can receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishedEvent {
    Lifecycle(StageEvent),
    Metric(StageMetric),
}
