//! # Stage Queue Backing Store
//!
//! The small RPC-like surface a durable, transactional store must provide.
//! Implementations guarantee:
//!
//! - atomic lease: a dequeued message stays hidden from every other consumer
//!   until its visibility window expires, is extended, or the message is
//!   archived, requeued or dead-lettered
//! - dequeue order `is_critical desc, priority desc, enqueued_at asc`
//! - expired leases are reclaimed by the next dequeue
//! - `archive_message` on an unknown id is not an error

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use uuid::Uuid;

use super::errors::QueueResult;
use super::message::{
    DeadLetterRequest, DelayedRequeueOptions, EnqueueOptions, MessageId, QueueDepth, StageMessage,
};

#[async_trait]
pub trait StageQueueStore: Send + Sync + Debug {
    /// Insert a message; returns its id
    async fn enqueue_stage(
        &self,
        queue_name: &str,
        job_id: Option<Uuid>,
        stage: &str,
        payload: &Value,
        options: &EnqueueOptions,
    ) -> QueueResult<MessageId>;

    /// Lease at most one visible message
    async fn dequeue_stage(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
    ) -> QueueResult<Option<StageMessage>>;

    /// Lease up to `batch_size` visible messages
    async fn dequeue_stage_batch(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
        batch_size: u32,
    ) -> QueueResult<Vec<StageMessage>>;

    /// Permanently remove a message; `false` when it was already gone
    async fn archive_message(&self, queue_name: &str, msg_id: MessageId) -> QueueResult<bool>;

    /// Permanently remove messages; returns how many were still present
    async fn archive_messages(&self, queue_name: &str, msg_ids: &[MessageId]) -> QueueResult<u64>;

    /// Push back the lease of a message still owned by `(job_id, stage)`
    async fn extend_message_visibility(
        &self,
        queue_name: &str,
        msg_id: MessageId,
        job_id: Uuid,
        stage: &str,
        additional_seconds: u32,
    ) -> QueueResult<bool>;

    /// Atomically archive `msg_id` and enqueue a delayed copy; returns the new id
    ///
    /// The copy carries the original's deliveries in `prior_attempts`. Fails
    /// with [`super::QueueError::MessageNotFound`] and enqueues nothing when
    /// `msg_id` is no longer live.
    async fn delayed_requeue_stage(
        &self,
        queue_name: &str,
        msg_id: MessageId,
        job_id: Uuid,
        stage: &str,
        payload: &Value,
        options: &DelayedRequeueOptions,
    ) -> QueueResult<MessageId>;

    /// Record a dead letter and remove the live message; returns the record id
    async fn move_to_dead_letter(
        &self,
        queue_name: &str,
        request: &DeadLetterRequest,
    ) -> QueueResult<i64>;

    async fn get_queue_depth(&self, queue_name: &str) -> QueueResult<QueueDepth>;
}
