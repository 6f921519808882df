//! # Stage Queue Message Structures
//!
//! Message, option and record types exchanged with the stage queue backing
//! store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lease handle of a queued message
pub type MessageId = i64;

/// A leased stage message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMessage {
    pub msg_id: MessageId,
    /// Missing for malformed messages from external producers
    pub job_id: Option<Uuid>,
    pub stage: String,
    pub payload: Value,
    /// Higher is dequeued first
    pub priority: i32,
    /// Critical messages are dequeued ahead of every non-critical message
    pub is_critical: bool,
    pub enqueued_at: DateTime<Utc>,
    /// Visible from this instant (delay or lease expiry)
    pub available_at: DateTime<Utc>,
    /// Number of times this message has been leased
    pub read_count: i32,
    /// Deliveries spent on this job stage by the messages this one replaced
    pub prior_attempts: i32,
    /// Lifecycle attempt budget requested by the producer
    pub max_attempts: Option<i32>,
    /// Lifecycle base retry delay requested by the producer
    pub retry_delay_seconds: Option<i32>,
    /// Lease duration requested by the producer
    pub visibility_seconds: Option<i32>,
}

impl StageMessage {
    /// Seconds between enqueue and the message becoming visible
    pub fn delay_seconds(&self) -> i64 {
        (self.available_at - self.enqueued_at).num_seconds().max(0)
    }

    /// Milliseconds the message waited in the queue before `now`
    pub fn queue_latency_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.enqueued_at).num_milliseconds().max(0)
    }

    /// Attempt number of the current delivery counted across requeues
    pub fn delivery_attempt(&self) -> u32 {
        let total = i64::from(self.prior_attempts.max(0)) + i64::from(self.read_count.max(1));
        u32::try_from(total).unwrap_or(u32::MAX)
    }
}

/// Options for [`crate::messaging::StageQueue::enqueue`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnqueueOptions {
    pub priority: i32,
    /// Defers first visibility
    pub delay_seconds: u32,
    pub visibility_seconds: Option<u32>,
    pub max_attempts: Option<u32>,
    pub retry_delay_seconds: Option<u32>,
    pub is_critical: bool,
    /// Deliveries already spent on the job stage; carried by forwarding
    pub prior_attempts: u32,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay_seconds(mut self, delay_seconds: u32) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    pub fn with_visibility_seconds(mut self, visibility_seconds: u32) -> Self {
        self.visibility_seconds = Some(visibility_seconds);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_retry_delay_seconds(mut self, retry_delay_seconds: u32) -> Self {
        self.retry_delay_seconds = Some(retry_delay_seconds);
        self
    }

    pub fn with_prior_attempts(mut self, prior_attempts: u32) -> Self {
        self.prior_attempts = prior_attempts;
        self
    }

    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    /// Options that carry a leased message's settings over to a new message
    pub fn inherited_from(message: &StageMessage) -> Self {
        Self {
            priority: message.priority,
            delay_seconds: 0,
            visibility_seconds: message.visibility_seconds.and_then(to_u32),
            max_attempts: message.max_attempts.and_then(to_u32),
            retry_delay_seconds: message.retry_delay_seconds.and_then(to_u32),
            is_critical: message.is_critical,
            prior_attempts: to_u32(message.prior_attempts).unwrap_or(0),
        }
    }
}

fn to_u32(value: i32) -> Option<u32> {
    u32::try_from(value).ok()
}

/// Options for [`crate::messaging::StageQueue::delayed_requeue`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelayedRequeueOptions {
    pub base_delay_seconds: u32,
    /// Replaces the original message's priority
    pub priority_override: Option<i32>,
    pub visibility_seconds: Option<u32>,
}

/// Request to move a message to the dead-letter area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRequest {
    pub msg_id: MessageId,
    pub job_id: Option<Uuid>,
    pub stage: String,
    /// Snapshot of the original message
    pub message: Value,
    pub failure_reason: String,
    pub error_details: Value,
    pub attempt_count: u32,
}

/// Immutable snapshot of a permanently failed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub dead_letter_id: i64,
    pub queue_name: String,
    pub original_msg_id: MessageId,
    pub job_id: Option<Uuid>,
    pub stage: String,
    pub payload: Value,
    pub failure_reason: String,
    pub error_details: Value,
    pub attempt_count: i32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Backlog metrics for one queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queue_name: String,
    /// Live messages (visible, leased and delayed)
    pub total: i64,
    /// Ready to be dequeued now
    pub visible: i64,
    /// Leased with an unexpired visibility window
    pub in_flight: i64,
    /// Never leased and not yet visible
    pub delayed: i64,
    pub oldest_message_age_seconds: Option<i64>,
    pub dead_lettered: i64,
}
