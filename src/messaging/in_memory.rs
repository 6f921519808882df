//! # In-Memory Stage Queue Store
//!
//! Thread-safe in-memory backing store for testing and single-process use.
//!
//! ## Features
//!
//! - **Visibility Timeout**: leased messages are hidden until their window expires
//! - **Ordering**: `is_critical desc, priority desc, enqueued_at asc`
//! - **Dead Letters**: kept per queue and inspectable through [`InMemoryStageQueueStore::dead_letters`]
//! - **Thread-Safe**: one `tokio::sync::RwLock` guards all queues, so every
//!   operation is atomic

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::backing_store::StageQueueStore;
use super::errors::{QueueError, QueueResult};
use super::message::{
    DeadLetterRecord, DeadLetterRequest, DelayedRequeueOptions, EnqueueOptions, MessageId,
    QueueDepth, StageMessage,
};

/// Messages and dead letters of one queue
#[derive(Debug, Default)]
struct InMemoryQueue {
    messages: Vec<StageMessage>,
    dead_letters: Vec<DeadLetterRecord>,
}

impl InMemoryQueue {
    fn position(&self, msg_id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.msg_id == msg_id)
    }

    fn remove(&mut self, msg_id: MessageId) -> Option<StageMessage> {
        self.position(msg_id).map(|index| self.messages.remove(index))
    }
}

/// In-memory stage queue store
///
/// # Example
///
/// ```rust
/// use stage_engine::messaging::{EnqueueOptions, InMemoryStageQueueStore, StageQueueStore};
/// use serde_json::json;
/// use uuid::Uuid;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryStageQueueStore::new();
/// let msg_id = store
///     .enqueue_stage("content_stages", Some(Uuid::new_v4()), "research", &json!({}), &EnqueueOptions::default())
///     .await?;
///
/// let leased = store.dequeue_stage("content_stages", 30).await?;
/// assert_eq!(leased.map(|m| m.msg_id), Some(msg_id));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryStageQueueStore {
    queues: RwLock<HashMap<String, InMemoryQueue>>,
    next_msg_id: AtomicI64,
    next_dead_letter_id: AtomicI64,
}

impl Default for InMemoryStageQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStageQueueStore {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            next_msg_id: AtomicI64::new(1),
            next_dead_letter_id: AtomicI64::new(1),
        }
    }

    /// Dead-letter records of a queue, oldest first
    pub async fn dead_letters(&self, queue_name: &str) -> Vec<DeadLetterRecord> {
        let queues = self.queues.read().await;
        queues
            .get(queue_name)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Every live message of a queue without leasing it, in dequeue order
    pub async fn messages(&self, queue_name: &str) -> Vec<StageMessage> {
        let queues = self.queues.read().await;
        let mut messages = queues
            .get(queue_name)
            .map(|q| q.messages.clone())
            .unwrap_or_default();
        messages.sort_by(dequeue_order);
        messages
    }

    /// Number of live messages in a queue
    pub async fn queue_length(&self, queue_name: &str) -> usize {
        let queues = self.queues.read().await;
        queues.get(queue_name).map(|q| q.messages.len()).unwrap_or(0)
    }

    fn allocate_msg_id(&self) -> MessageId {
        self.next_msg_id.fetch_add(1, Ordering::SeqCst)
    }

    fn lease(
        queue: &mut InMemoryQueue,
        now: DateTime<Utc>,
        visibility_seconds: u32,
        limit: usize,
    ) -> Vec<StageMessage> {
        let mut visible: Vec<&mut StageMessage> = queue
            .messages
            .iter_mut()
            .filter(|m| m.available_at <= now)
            .collect();
        visible.sort_by(|a, b| dequeue_order(a, b));

        visible
            .into_iter()
            .take(limit)
            .map(|message| {
                message.available_at = now + Duration::seconds(i64::from(visibility_seconds));
                message.read_count += 1;
                message.clone()
            })
            .collect()
    }
}

fn dequeue_order(a: &StageMessage, b: &StageMessage) -> std::cmp::Ordering {
    b.is_critical
        .cmp(&a.is_critical)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
        .then_with(|| a.msg_id.cmp(&b.msg_id))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl StageQueueStore for InMemoryStageQueueStore {
    async fn enqueue_stage(
        &self,
        queue_name: &str,
        job_id: Option<Uuid>,
        stage: &str,
        payload: &Value,
        options: &EnqueueOptions,
    ) -> QueueResult<MessageId> {
        let now = Utc::now();
        let msg_id = self.allocate_msg_id();
        let message = StageMessage {
            msg_id,
            job_id,
            stage: stage.to_string(),
            payload: payload.clone(),
            priority: options.priority,
            is_critical: options.is_critical,
            enqueued_at: now,
            available_at: now + Duration::seconds(i64::from(options.delay_seconds)),
            read_count: 0,
            prior_attempts: to_i32(options.prior_attempts),
            max_attempts: options.max_attempts.map(to_i32),
            retry_delay_seconds: options.retry_delay_seconds.map(to_i32),
            visibility_seconds: options.visibility_seconds.map(to_i32),
        };

        let mut queues = self.queues.write().await;
        queues
            .entry(queue_name.to_string())
            .or_default()
            .messages
            .push(message);

        Ok(msg_id)
    }

    async fn dequeue_stage(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
    ) -> QueueResult<Option<StageMessage>> {
        let mut batch = self
            .dequeue_stage_batch(queue_name, visibility_seconds, 1)
            .await?;
        Ok(batch.pop())
    }

    async fn dequeue_stage_batch(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
        batch_size: u32,
    ) -> QueueResult<Vec<StageMessage>> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(Vec::new());
        };

        Ok(Self::lease(
            queue,
            Utc::now(),
            visibility_seconds,
            batch_size as usize,
        ))
    }

    async fn archive_message(&self, queue_name: &str, msg_id: MessageId) -> QueueResult<bool> {
        let mut queues = self.queues.write().await;
        Ok(queues
            .get_mut(queue_name)
            .and_then(|queue| queue.remove(msg_id))
            .is_some())
    }

    async fn archive_messages(&self, queue_name: &str, msg_ids: &[MessageId]) -> QueueResult<u64> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(0);
        };

        let before = queue.messages.len();
        queue.messages.retain(|m| !msg_ids.contains(&m.msg_id));
        Ok((before - queue.messages.len()) as u64)
    }

    async fn extend_message_visibility(
        &self,
        queue_name: &str,
        msg_id: MessageId,
        job_id: Uuid,
        stage: &str,
        additional_seconds: u32,
    ) -> QueueResult<bool> {
        let now = Utc::now();
        let mut queues = self.queues.write().await;
        let leased = queues
            .get_mut(queue_name)
            .and_then(|queue| queue.messages.iter_mut().find(|m| m.msg_id == msg_id))
            .filter(|m| {
                m.job_id == Some(job_id) && m.stage == stage && m.read_count > 0 && m.available_at > now
            });

        match leased {
            Some(message) => {
                message.available_at += Duration::seconds(i64::from(additional_seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delayed_requeue_stage(
        &self,
        queue_name: &str,
        msg_id: MessageId,
        job_id: Uuid,
        stage: &str,
        payload: &Value,
        options: &DelayedRequeueOptions,
    ) -> QueueResult<MessageId> {
        let now = Utc::now();
        let mut queues = self.queues.write().await;
        let original = queues
            .get_mut(queue_name)
            .and_then(|queue| queue.remove(msg_id))
            .ok_or_else(|| QueueError::message_not_found(queue_name, msg_id))?;

        let new_id = self.allocate_msg_id();
        let queue = queues.entry(queue_name.to_string()).or_default();
        queue.messages.push(StageMessage {
            msg_id: new_id,
            job_id: Some(job_id),
            stage: stage.to_string(),
            payload: payload.clone(),
            priority: options.priority_override.unwrap_or(original.priority),
            is_critical: original.is_critical,
            enqueued_at: now,
            available_at: now + Duration::seconds(i64::from(options.base_delay_seconds)),
            read_count: 0,
            prior_attempts: original
                .prior_attempts
                .saturating_add(original.read_count.max(1)),
            max_attempts: original.max_attempts,
            retry_delay_seconds: original.retry_delay_seconds,
            visibility_seconds: options
                .visibility_seconds
                .map(to_i32)
                .or(original.visibility_seconds),
        });

        Ok(new_id)
    }

    async fn move_to_dead_letter(
        &self,
        queue_name: &str,
        request: &DeadLetterRequest,
    ) -> QueueResult<i64> {
        let mut queues = self.queues.write().await;
        let queue = queues.entry(queue_name.to_string()).or_default();
        queue.remove(request.msg_id);

        let dead_letter_id = self.next_dead_letter_id.fetch_add(1, Ordering::SeqCst);
        queue.dead_letters.push(DeadLetterRecord {
            dead_letter_id,
            queue_name: queue_name.to_string(),
            original_msg_id: request.msg_id,
            job_id: request.job_id,
            stage: request.stage.clone(),
            payload: request.message.clone(),
            failure_reason: request.failure_reason.clone(),
            error_details: request.error_details.clone(),
            attempt_count: to_i32(request.attempt_count),
            dead_lettered_at: Utc::now(),
        });

        Ok(dead_letter_id)
    }

    async fn get_queue_depth(&self, queue_name: &str) -> QueueResult<QueueDepth> {
        let now = Utc::now();
        let queues = self.queues.read().await;
        let Some(queue) = queues.get(queue_name) else {
            return Ok(QueueDepth {
                queue_name: queue_name.to_string(),
                ..QueueDepth::default()
            });
        };

        let mut visible = 0;
        let mut in_flight = 0;
        let mut delayed = 0;
        for message in &queue.messages {
            if message.available_at <= now {
                visible += 1;
            } else if message.read_count > 0 {
                in_flight += 1;
            } else {
                delayed += 1;
            }
        }

        Ok(QueueDepth {
            queue_name: queue_name.to_string(),
            total: queue.messages.len() as i64,
            visible,
            in_flight,
            delayed,
            oldest_message_age_seconds: queue
                .messages
                .iter()
                .map(|m| m.enqueued_at)
                .min()
                .map(|oldest| (now - oldest).num_seconds()),
            dead_lettered: queue.dead_letters.len() as i64,
        })
    }
}
