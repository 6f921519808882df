//! Engine wired over in-memory stores, with an event subscription for
//! asserting on emitted lifecycle events.

use std::sync::Arc;

use serde_json::Value;
use stage_engine::events::{PublishedEvent, StageEvent, StageEventKind, StageEventPublisher};
use stage_engine::messaging::{
    EnqueueOptions, InMemoryStageQueueStore, StageMessage, StageQueue, StageQueueStore,
};
use stage_engine::orchestration::{HandlerRetryPolicy, StageHandler, StageRunner, StageRunnerConfig};
use stage_engine::retry::RetryConfig;
use stage_engine::state_machine::{
    InMemoryStageLifecycleStore, StageLifecycleStore, StageLifecycleTracker,
};
use tokio::sync::broadcast;
use uuid::Uuid;

pub const QUEUE: &str = "content_stages";

/// In-process retries that finish in milliseconds
pub fn fast_runner_config() -> StageRunnerConfig {
    StageRunnerConfig {
        handler_retry: HandlerRetryPolicy::fixed(
            RetryConfig::exponential(1, 2)
                .with_jitter(false)
                .with_max_attempts(2),
        ),
        ..StageRunnerConfig::default()
    }
}

pub struct EngineHarness {
    pub store: Arc<InMemoryStageQueueStore>,
    pub queue: StageQueue,
    pub tracker: StageLifecycleTracker,
    pub events: Arc<StageEventPublisher>,
}

impl EngineHarness {
    pub fn new() -> Self {
        stage_engine::logging::init_structured_logging();
        let store = Arc::new(InMemoryStageQueueStore::new());
        Self::with_stores(
            store.clone(),
            store,
            Arc::new(InMemoryStageLifecycleStore::new()),
        )
    }

    /// `queue_store` backs the runner; `store` is the in-memory store
    /// underneath it, kept for inspection
    pub fn with_stores(
        store: Arc<InMemoryStageQueueStore>,
        queue_store: Arc<dyn StageQueueStore>,
        lifecycle: Arc<dyn StageLifecycleStore>,
    ) -> Self {
        Self {
            store,
            queue: StageQueue::new(queue_store),
            tracker: StageLifecycleTracker::new(lifecycle),
            events: Arc::new(StageEventPublisher::default()),
        }
    }

    pub fn runner<H: StageHandler + 'static>(&self, stage: &str, handler: H) -> StageRunner {
        StageRunner::new(
            stage,
            QUEUE,
            self.queue.clone(),
            self.tracker.clone(),
            Arc::new(handler),
        )
        .with_config(fast_runner_config())
        .with_event_sink(self.events.clone())
    }

    /// Enqueue a message for a fresh job and lease it straight away
    pub async fn lease(&self, stage: &str, payload: Value) -> StageMessage {
        self.lease_with(Uuid::new_v4(), stage, payload, &EnqueueOptions::default())
            .await
    }

    pub async fn lease_with(
        &self,
        job_id: Uuid,
        stage: &str,
        payload: Value,
        options: &EnqueueOptions,
    ) -> StageMessage {
        self.store
            .enqueue_stage(QUEUE, Some(job_id), stage, &payload, options)
            .await
            .expect("enqueue");
        self.store
            .dequeue_stage(QUEUE, 30)
            .await
            .expect("dequeue")
            .expect("visible message")
    }
}

/// Lifecycle events received so far, in publication order
pub fn drain_lifecycle_events(receiver: &mut broadcast::Receiver<PublishedEvent>) -> Vec<StageEvent> {
    let mut events = Vec::new();
    while let Ok(published) = receiver.try_recv() {
        if let PublishedEvent::Lifecycle(event) = published {
            events.push(event);
        }
    }
    events
}

pub fn event_kinds(events: &[StageEvent]) -> Vec<StageEventKind> {
    events.iter().map(|event| event.kind).collect()
}
