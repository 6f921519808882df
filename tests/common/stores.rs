//! Store wrappers that fail selected operations on demand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use stage_engine::messaging::{
    DeadLetterRequest, DelayedRequeueOptions, EnqueueOptions, InMemoryStageQueueStore, MessageId,
    QueueDepth, QueueError, QueueResult, StageMessage, StageQueueStore,
};
use stage_engine::state_machine::{
    JobSummary, JobUpdate, LifecycleError, LifecycleResult, StageLifecycleEntry,
    StageLifecycleStore, StageSettings,
};
use uuid::Uuid;

/// Queue store that delegates to an in-memory store unless a failure switch
/// is flipped
#[derive(Debug)]
pub struct FlakyQueueStore {
    inner: Arc<InMemoryStageQueueStore>,
    pub fail_enqueue: AtomicBool,
    pub fail_requeue: AtomicBool,
    pub fail_dead_letter: AtomicBool,
    pub fail_archive: AtomicBool,
}

impl FlakyQueueStore {
    pub fn new(inner: Arc<InMemoryStageQueueStore>) -> Self {
        Self {
            inner,
            fail_enqueue: AtomicBool::new(false),
            fail_requeue: AtomicBool::new(false),
            fail_dead_letter: AtomicBool::new(false),
            fail_archive: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool, queue_name: &str, operation: &str) -> QueueResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(QueueError::queue_operation(
                queue_name,
                operation,
                "backing store unavailable",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StageQueueStore for FlakyQueueStore {
    async fn enqueue_stage(
        &self,
        queue_name: &str,
        job_id: Option<Uuid>,
        stage: &str,
        payload: &Value,
        options: &EnqueueOptions,
    ) -> QueueResult<MessageId> {
        Self::check(&self.fail_enqueue, queue_name, "enqueue_stage")?;
        self.inner
            .enqueue_stage(queue_name, job_id, stage, payload, options)
            .await
    }

    async fn dequeue_stage(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
    ) -> QueueResult<Option<StageMessage>> {
        self.inner.dequeue_stage(queue_name, visibility_seconds).await
    }

    async fn dequeue_stage_batch(
        &self,
        queue_name: &str,
        visibility_seconds: u32,
        batch_size: u32,
    ) -> QueueResult<Vec<StageMessage>> {
        self.inner
            .dequeue_stage_batch(queue_name, visibility_seconds, batch_size)
            .await
    }

    async fn archive_message(&self, queue_name: &str, msg_id: MessageId) -> QueueResult<bool> {
        Self::check(&self.fail_archive, queue_name, "archive_message")?;
        self.inner.archive_message(queue_name, msg_id).await
    }

    async fn archive_messages(&self, queue_name: &str, msg_ids: &[MessageId]) -> QueueResult<u64> {
        Self::check(&self.fail_archive, queue_name, "archive_messages")?;
        self.inner.archive_messages(queue_name, msg_ids).await
    }

    async fn extend_message_visibility(
        &self,
        queue_name: &str,
        msg_id: MessageId,
        job_id: Uuid,
        stage: &str,
        additional_seconds: u32,
    ) -> QueueResult<bool> {
        self.inner
            .extend_message_visibility(queue_name, msg_id, job_id, stage, additional_seconds)
            .await
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
        Self::check(&self.fail_requeue, queue_name, "delayed_requeue_stage")?;
        self.inner
            .delayed_requeue_stage(queue_name, msg_id, job_id, stage, payload, options)
            .await
    }

    async fn move_to_dead_letter(
        &self,
        queue_name: &str,
        request: &DeadLetterRequest,
    ) -> QueueResult<i64> {
        Self::check(&self.fail_dead_letter, queue_name, "move_to_dead_letter")?;
        self.inner.move_to_dead_letter(queue_name, request).await
    }

    async fn get_queue_depth(&self, queue_name: &str) -> QueueResult<QueueDepth> {
        self.inner.get_queue_depth(queue_name).await
    }
}

/// Lifecycle store whose every call fails
#[derive(Debug, Default)]
pub struct UnavailableLifecycleStore;

fn unavailable<T>() -> LifecycleResult<T> {
    Err(LifecycleError::Database("connection refused".to_string()))
}

#[async_trait]
impl StageLifecycleStore for UnavailableLifecycleStore {
    async fn begin_attempt(
        &self,
        _job_id: Uuid,
        _stage: &str,
        _settings: &StageSettings,
    ) -> LifecycleResult<StageLifecycleEntry> {
        unavailable()
    }

    async fn load_stage(
        &self,
        _job_id: Uuid,
        _stage: &str,
    ) -> LifecycleResult<Option<StageLifecycleEntry>> {
        unavailable()
    }

    async fn save_stage(&self, _entry: &StageLifecycleEntry) -> LifecycleResult<()> {
        unavailable()
    }

    async fn update_job(&self, _update: &JobUpdate) -> LifecycleResult<JobSummary> {
        unavailable()
    }

    async fn load_job(&self, _job_id: Uuid) -> LifecycleResult<Option<JobSummary>> {
        unavailable()
    }

    async fn list_stages(&self, _job_id: Uuid) -> LifecycleResult<Vec<StageLifecycleEntry>> {
        unavailable()
    }
}
