//! # PostgreSQL Stage Queue Store
//!
//! Calls the SQL functions shipped in `migrations/`, one function per backing
//! store operation. Leasing uses `FOR UPDATE SKIP LOCKED` inside the
//! functions, so concurrent consumers never receive the same message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::backing_store::StageQueueStore;
use super::errors::{QueueError, QueueResult};
use super::message::{
    DeadLetterRequest, DelayedRequeueOptions, EnqueueOptions, MessageId, QueueDepth, StageMessage,
};

#[derive(Debug, sqlx::FromRow)]
struct StageMessageRow {
    msg_id: i64,
    job_id: Option<Uuid>,
    stage: String,
    payload: Value,
    priority: i32,
    is_critical: bool,
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    read_count: i32,
    prior_attempts: i32,
    max_attempts: Option<i32>,
    retry_delay_seconds: Option<i32>,
    visibility_seconds: Option<i32>,
}

impl From<StageMessageRow> for StageMessage {
    fn from(row: StageMessageRow) -> Self {
        Self {
            msg_id: row.msg_id,
            job_id: row.job_id,
            stage: row.stage,
            payload: row.payload,
            priority: row.priority,
            is_critical: row.is_critical,
            enqueued_at: row.enqueued_at,
            available_at: row.available_at,
            read_count: row.read_count,
            prior_attempts: row.prior_attempts,
            max_attempts: row.max_attempts,
            retry_delay_seconds: row.retry_delay_seconds,
            visibility_seconds: row.visibility_seconds,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QueueDepthRow {
    total: i64,
    visible: i64,
    in_flight: i64,
    delayed: i64,
    oldest_message_age_seconds: Option<i64>,
    dead_lettered: i64,
}

const MESSAGE_COLUMNS: &str = "msg_id, job_id, stage, payload, priority, is_critical, \
     enqueued_at, available_at, read_count, prior_attempts, max_attempts, retry_delay_seconds, \
     visibility_seconds";

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Stage queue store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgStageQueueStore {
    pool: PgPool,
}

impl PgStageQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StageQueueStore for PgStageQueueStore {
    async fn enqueue_stage(
        &self,
        queue_name: &str,
        job_id: Option<Uuid>,
        stage: &str,
        payload: &Value,
        options: &EnqueueOptions,
    ) -> QueueResult<MessageId> {
        let msg_id: i64 = sqlx::query_scalar(
            "SELECT enqueue_stage($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(queue_name)
        .bind(job_id)
        .bind(stage)
        .bind(payload)
        .bind(options.priority)
        .bind(to_i32(options.delay_seconds))
        .bind(options.visibility_seconds.map(to_i32))
        .bind(options.max_attempts.map(to_i32))
        .bind(options.retry_delay_seconds.map(to_i32))
        .bind(options.is_critical)
        .bind(to_i32(options.prior_attempts))
        .fetch_one(&self.pool)
        .await?;

        debug!(queue_name = %queue_name, msg_id = msg_id, stage = %stage, "Enqueued stage message");
        Ok(msg_id)
    }

    async fn dequeue_stage(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
    ) -> QueueResult<Option<StageMessage>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM dequeue_stage($1, $2)");
        let row = sqlx::query_as::<_, StageMessageRow>(&sql)
            .bind(queue_name)
            .bind(to_i32(visibility_seconds))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(StageMessage::from))
    }

    async fn dequeue_stage_batch(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
        batch_size: u32,
    ) -> QueueResult<Vec<StageMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM dequeue_stage_batch($1, $2, $3) \
             ORDER BY is_critical DESC, priority DESC, enqueued_at ASC, msg_id ASC"
        );
        let rows = sqlx::query_as::<_, StageMessageRow>(&sql)
            .bind(queue_name)
            .bind(to_i32(visibility_seconds))
            .bind(to_i32(batch_size))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(StageMessage::from).collect())
    }

    async fn archive_message(&self, queue_name: &str, msg_id: MessageId) -> QueueResult<bool> {
        let archived: bool = sqlx::query_scalar("SELECT archive_message($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(archived)
    }

    async fn archive_messages(&self, queue_name: &str, msg_ids: &[MessageId]) -> QueueResult<u64> {
        let archived: i64 = sqlx::query_scalar("SELECT archive_messages($1, $2)")
            .bind(queue_name)
            .bind(msg_ids)
            .fetch_one(&self.pool)
            .await?;
        Ok(archived.max(0) as u64)
    }

    async fn extend_message_visibility(
        &self,
        queue_name: &str,
        msg_id: MessageId,
        job_id: Uuid,
        stage: &str,
        additional_seconds: u32,
    ) -> QueueResult<bool> {
        let extended: bool =
            sqlx::query_scalar("SELECT extend_message_visibility($1, $2, $3, $4, $5)")
                .bind(queue_name)
                .bind(msg_id)
                .bind(job_id)
                .bind(stage)
                .bind(to_i32(additional_seconds))
                .fetch_one(&self.pool)
                .await?;
        Ok(extended)
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
        let new_id: Option<i64> =
            sqlx::query_scalar("SELECT delayed_requeue_stage($1, $2, $3, $4, $5, $6, $7, $8)")
                .bind(queue_name)
                .bind(msg_id)
                .bind(job_id)
                .bind(stage)
                .bind(payload)
                .bind(to_i32(options.base_delay_seconds))
                .bind(options.priority_override)
                .bind(options.visibility_seconds.map(to_i32))
                .fetch_one(&self.pool)
                .await?;
        new_id.ok_or_else(|| QueueError::message_not_found(queue_name, msg_id))
    }

    async fn move_to_dead_letter(
        &self,
        queue_name: &str,
        request: &DeadLetterRequest,
    ) -> QueueResult<i64> {
        let dead_letter_id: i64 =
            sqlx::query_scalar("SELECT move_to_dead_letter($1, $2, $3, $4, $5, $6, $7, $8)")
                .bind(queue_name)
                .bind(request.msg_id)
                .bind(request.job_id)
                .bind(&request.stage)
                .bind(&request.message)
                .bind(&request.failure_reason)
                .bind(&request.error_details)
                .bind(to_i32(request.attempt_count))
                .fetch_one(&self.pool)
                .await?;
        Ok(dead_letter_id)
    }

    async fn get_queue_depth(&self, queue_name: &str) -> QueueResult<QueueDepth> {
        let row = sqlx::query_as::<_, QueueDepthRow>(
            "SELECT total, visible, in_flight, delayed, oldest_message_age_seconds, dead_lettered \
             FROM get_queue_depth($1)",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueDepth {
            queue_name: queue_name.to_string(),
            total: row.total,
            visible: row.visible,
            in_flight: row.in_flight,
            delayed: row.delayed,
            oldest_message_age_seconds: row.oldest_message_age_seconds,
            dead_lettered: row.dead_lettered,
        })
    }
}
