//! # Stage Queue
//!
//! Validating, logging facade over a [`StageQueueStore`]. The stage runner,
//! the consumer loop and handlers (through their context) all talk to the
//! queue through this type; backing-store failures propagate unchanged.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backing_store::StageQueueStore;
use super::errors::{QueueError, QueueResult};
use super::message::{
    DeadLetterRequest, DelayedRequeueOptions, EnqueueOptions, MessageId, QueueDepth, StageMessage,
};

const MAX_QUEUE_NAME_LENGTH: usize = 63;

/// Validate a queue name: non-empty, at most 63 characters, ASCII
/// alphanumerics, `_` and `-` only
pub fn validate_queue_name(queue_name: &str) -> QueueResult<()> {
    if queue_name.is_empty() {
        return Err(QueueError::invalid_queue_name(queue_name, "must not be empty"));
    }
    if queue_name.len() > MAX_QUEUE_NAME_LENGTH {
        return Err(QueueError::invalid_queue_name(
            queue_name,
            format!("must be at most {MAX_QUEUE_NAME_LENGTH} characters"),
        ));
    }
    if !queue_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(QueueError::invalid_queue_name(
            queue_name,
            "only ASCII letters, digits, '_' and '-' are allowed",
        ));
    }
    Ok(())
}

fn validate_stage(operation: &str, stage: &str) -> QueueResult<()> {
    if stage.trim().is_empty() {
        return Err(QueueError::invalid_request(operation, "stage must not be empty"));
    }
    Ok(())
}

/// Stage queue facade
#[derive(Debug, Clone)]
pub struct StageQueue {
    store: Arc<dyn StageQueueStore>,
}

impl StageQueue {
    pub fn new(store: Arc<dyn StageQueueStore>) -> Self {
        Self { store }
    }

    /// Backing store shared by this queue
    pub fn store(&self) -> &Arc<dyn StageQueueStore> {
        &self.store
    }

    /// Enqueue a stage message for a job; returns its message id
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job_id: Uuid,
        stage: &str,
        payload: &Value,
        options: &EnqueueOptions,
    ) -> QueueResult<MessageId> {
        validate_queue_name(queue_name)?;
        validate_stage("enqueue", stage)?;

        let msg_id = self
            .store
            .enqueue_stage(queue_name, Some(job_id), stage, payload, options)
            .await?;

        debug!(
            queue_name = %queue_name,
            msg_id = msg_id,
            job_id = %job_id,
            stage = %stage,
            priority = options.priority,
            delay_seconds = options.delay_seconds,
            "📤 Stage message enqueued"
        );
        Ok(msg_id)
    }

    /// Lease at most one visible message
    pub async fn dequeue(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
    ) -> QueueResult<Option<StageMessage>> {
        validate_queue_name(queue_name)?;

        let message = self.store.dequeue_stage(queue_name, visibility_seconds).await?;
        if let Some(message) = &message {
            debug!(
                queue_name = %queue_name,
                msg_id = message.msg_id,
                stage = %message.stage,
                read_count = message.read_count,
                "📥 Stage message leased"
            );
        }
        Ok(message)
    }

    /// Lease up to `batch_size` visible messages
    pub async fn dequeue_batch(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
        batch_size: u32,
    ) -> QueueResult<Vec<StageMessage>> {
        validate_queue_name(queue_name)?;
        if batch_size == 0 {
            return Err(QueueError::invalid_request(
                "dequeue_batch",
                "batch_size must be at least 1",
            ));
        }

        let messages = self
            .store
            .dequeue_stage_batch(queue_name, visibility_seconds, batch_size)
            .await?;
        if !messages.is_empty() {
            debug!(
                queue_name = %queue_name,
                count = messages.len(),
                batch_size = batch_size,
                "📥 Stage message batch leased"
            );
        }
        Ok(messages)
    }

    /// Permanently remove a message. Acking an unknown or already-acked id is
    /// not an error.
    pub async fn ack(&self, queue_name: &str, msg_id: MessageId) -> QueueResult<()> {
        validate_queue_name(queue_name)?;

        let removed = self.store.archive_message(queue_name, msg_id).await?;
        if removed {
            debug!(queue_name = %queue_name, msg_id = msg_id, "✅ Stage message acknowledged");
        } else {
            debug!(
                queue_name = %queue_name,
                msg_id = msg_id,
                "Stage message already acknowledged"
            );
        }
        Ok(())
    }

    /// Acknowledge several messages; returns how many were still present
    pub async fn ack_batch(&self, queue_name: &str, msg_ids: &[MessageId]) -> QueueResult<u64> {
        validate_queue_name(queue_name)?;
        if msg_ids.is_empty() {
            return Ok(0);
        }

        let removed = self.store.archive_messages(queue_name, msg_ids).await?;
        debug!(
            queue_name = %queue_name,
            requested = msg_ids.len(),
            removed = removed,
            "✅ Stage message batch acknowledged"
        );
        Ok(removed)
    }

    /// Extend the lease of a message still owned by `(job_id, stage)`.
    /// Returns `false` when the lease expired or moved on.
    pub async fn extend_visibility(
        &self,
        queue_name: &str,
        msg_id: MessageId,
        job_id: Uuid,
        stage: &str,
        additional_seconds: u32,
    ) -> QueueResult<bool> {
        validate_queue_name(queue_name)?;
        validate_stage("extend_visibility", stage)?;

        let extended = self
            .store
            .extend_message_visibility(queue_name, msg_id, job_id, stage, additional_seconds)
            .await?;
        if !extended {
            warn!(
                queue_name = %queue_name,
                msg_id = msg_id,
                job_id = %job_id,
                stage = %stage,
                "⚠️ Visibility extension refused, lease no longer held"
            );
        }
        Ok(extended)
    }

    /// Acknowledge `msg_id` and enqueue a delayed copy in one step; returns
    /// the new message id
    pub async fn delayed_requeue(
        &self,
        queue_name: &str,
        msg_id: MessageId,
        job_id: Uuid,
        stage: &str,
        payload: &Value,
        options: &DelayedRequeueOptions,
    ) -> QueueResult<MessageId> {
        validate_queue_name(queue_name)?;
        validate_stage("delayed_requeue", stage)?;

        let new_msg_id = self
            .store
            .delayed_requeue_stage(queue_name, msg_id, job_id, stage, payload, options)
            .await?;

        info!(
            queue_name = %queue_name,
            msg_id = msg_id,
            new_msg_id = new_msg_id,
            job_id = %job_id,
            stage = %stage,
            delay_seconds = options.base_delay_seconds,
            "🔁 Stage message requeued with delay"
        );
        Ok(new_msg_id)
    }

    /// Record a dead letter and remove the live message; returns the record id
    pub async fn move_to_dead_letter(
        &self,
        queue_name: &str,
        request: &DeadLetterRequest,
    ) -> QueueResult<i64> {
        validate_queue_name(queue_name)?;

        let dead_letter_id = self.store.move_to_dead_letter(queue_name, request).await?;

        warn!(
            queue_name = %queue_name,
            msg_id = request.msg_id,
            dead_letter_id = dead_letter_id,
            stage = %request.stage,
            failure_reason = %request.failure_reason,
            attempt_count = request.attempt_count,
            "💀 Stage message dead-lettered"
        );
        Ok(dead_letter_id)
    }

    pub async fn queue_depth(&self, queue_name: &str) -> QueueResult<QueueDepth> {
        validate_queue_name(queue_name)?;
        debug!("📊 Getting depth for queue: {}", queue_name);
        self.store.get_queue_depth(queue_name).await
    }
}
