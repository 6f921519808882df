//! End-to-end stage runner scenarios over the in-memory stores.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::*;
use serde_json::json;
use stage_engine::events::StageEventKind;
use stage_engine::messaging::{
    EnqueueOptions, InMemoryStageQueueStore, QueueError, StageQueueStore,
};
use stage_engine::orchestration::{
    handler_fn, ConsumerConfig, ContinuationMessage, DeadLetterReason, StageConsumer, StageError,
    StageOutcome, StageRunOutcome, StageRunner, StageRunnerConfig,
};
use stage_engine::state_machine::{
    InMemoryStageLifecycleStore, JobStatus, StageLifecycleEntry, StageSettings, StageStatus,
};
use stage_engine::StageEngineError;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn completing() -> impl stage_engine::StageHandler {
    handler_fn(|_ctx| async { Ok(StageOutcome::Complete) })
}

fn failing_with<F>(error: F) -> impl stage_engine::StageHandler
where
    F: Fn() -> StageError + Send + Sync + 'static,
{
    handler_fn(move |_ctx| {
        let error = error();
        async move { Err(error) }
    })
}

#[tokio::test]
async fn test_successful_stage_is_completed_and_acknowledged() {
    let h = EngineHarness::new();
    let mut events = h.events.subscribe();
    let runner = h.runner("research", completing());

    let message = h.lease("research", json!({"topic": "tidal energy"})).await;
    let job_id = message.job_id.unwrap();
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::Completed);
    assert_eq!(report.attempt, Some(1));
    assert_eq!(h.store.queue_length(QUEUE).await, 0);

    let progress = h.tracker.stage_progress(job_id).await.unwrap();
    assert_eq!(progress.stages.len(), 1);
    let entry = &progress.stages[0];
    assert_eq!(entry.status, StageStatus::Completed);
    assert_eq!(entry.attempt_count, 1);
    assert!(entry.finished_at.is_some());

    let job = progress.job.unwrap();
    assert_eq!(job.current_stage.as_deref(), Some("research"));
    assert!(job.last_completed_at.is_some());

    let kinds = event_kinds(&drain_lifecycle_events(&mut events));
    assert_eq!(
        kinds,
        vec![StageEventKind::StageStarted, StageEventKind::StageCompleted]
    );
}

#[tokio::test]
async fn test_retryable_failure_is_requeued_with_stage_backoff() {
    let h = EngineHarness::new();
    let mut events = h.events.subscribe();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let runner = h.runner(
        "research",
        handler_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StageError::failure("upstream request timeout")) }
        }),
    );

    let message = h.lease("research", json!({"topic": "kelp"})).await;
    let original_msg_id = message.msg_id;
    let job_id = message.job_id.unwrap();
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::Requeued);
    assert_eq!(report.attempt, Some(1));
    // both in-process attempts ran before the stage-level retry
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let messages = h.store.messages(QUEUE).await;
    assert_eq!(messages.len(), 1);
    let requeued = &messages[0];
    assert_ne!(requeued.msg_id, original_msg_id);
    assert_eq!(Some(requeued.msg_id), report.requeued_msg_id);
    assert_eq!(requeued.read_count, 0);
    assert_eq!(requeued.payload, json!({"topic": "kelp"}));
    // 60 s × 2^1
    assert_eq!(requeued.delay_seconds(), 120);

    let entry = h.tracker.stage_progress(job_id).await.unwrap().stages.remove(0);
    assert_eq!(entry.status, StageStatus::Error);
    assert!(entry.next_retry_at.is_some());
    assert!(entry.last_error.is_some());

    let kinds = event_kinds(&drain_lifecycle_events(&mut events));
    assert_eq!(
        kinds,
        vec![
            StageEventKind::StageStarted,
            StageEventKind::StageFailed,
            StageEventKind::StageRequeued,
        ]
    );
}

#[tokio::test]
async fn test_fatal_failure_is_dead_lettered_on_first_attempt() {
    let h = EngineHarness::new();
    let mut events = h.events.subscribe();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let runner = h.runner(
        "outline",
        handler_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StageError::fatal("invalid outline structure")) }
        }),
    );

    let payload = json!({"sections": []});
    let message = h.lease("outline", payload.clone()).await;
    let job_id = message.job_id.unwrap();
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::DeadLettered);
    assert_eq!(report.dead_letter_reason, Some(DeadLetterReason::FatalError));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.queue_length(QUEUE).await, 0);

    let dead_letters = h.store.dead_letters(QUEUE).await;
    assert_eq!(dead_letters.len(), 1);
    let record = &dead_letters[0];
    assert_eq!(Some(record.dead_letter_id), report.dead_letter_id);
    assert_eq!(record.job_id, Some(job_id));
    assert_eq!(record.stage, "outline");
    assert_eq!(record.payload, payload);
    assert_eq!(record.failure_reason, "fatal_error");
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.error_details["classification"]["fatal"], json!(true));

    let progress = h.tracker.stage_progress(job_id).await.unwrap();
    assert_eq!(progress.stages[0].status, StageStatus::Failed);
    assert_eq!(progress.job.unwrap().status, JobStatus::Failed);

    let kinds = event_kinds(&drain_lifecycle_events(&mut events));
    assert_eq!(kinds.last(), Some(&StageEventKind::StageDeadLettered));
}

#[tokio::test]
async fn test_client_error_is_dead_lettered_as_non_retryable() {
    let h = EngineHarness::new();
    let runner = h.runner("research", failing_with(|| StageError::http(400, "bad request")));

    let message = h.lease("research", json!({})).await;
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::DeadLettered);
    assert_eq!(
        report.dead_letter_reason,
        Some(DeadLetterReason::NonRetryableError)
    );
}

#[tokio::test]
async fn test_last_attempt_is_dead_lettered_as_exhausted() {
    let store = Arc::new(InMemoryStageQueueStore::new());
    let lifecycle = Arc::new(InMemoryStageLifecycleStore::new());
    let h = EngineHarness::with_stores(store.clone(), store, lifecycle.clone());
    let runner = h.runner("write", failing_with(|| StageError::retryable("model overloaded")));

    let job_id = Uuid::new_v4();
    let mut seeded = StageLifecycleEntry::new(job_id, "write", &StageSettings::default());
    seeded.attempt_count = 4;
    seeded.max_attempts = 5;
    seeded.status = StageStatus::Error;
    lifecycle.seed_stage(seeded);

    let message = h
        .lease_with(job_id, "write", json!({"draft": 3}), &EnqueueOptions::default())
        .await;
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::DeadLettered);
    assert_eq!(report.attempt, Some(5));
    assert_eq!(
        report.dead_letter_reason,
        Some(DeadLetterReason::MaxAttemptsExceeded)
    );
    assert!(report.classification.unwrap().retryable);
    assert!(h.tracker.should_dead_letter(job_id, "write").await.unwrap());

    let dead_letters = h.store.dead_letters(QUEUE).await;
    assert_eq!(dead_letters[0].failure_reason, "max_attempts_exceeded");
    assert_eq!(dead_letters[0].attempt_count, 5);
}

#[tokio::test]
async fn test_message_for_another_stage_is_forwarded_unchanged() {
    let h = EngineHarness::new();
    let mut events = h.events.subscribe();
    let runner = h.runner("research", completing());

    let job_id = Uuid::new_v4();
    let payload = json!({"checks": ["facts", "tone"]});
    let options = EnqueueOptions::default().with_priority(7);
    let message = h.lease_with(job_id, "qa", payload.clone(), &options).await;
    let original_msg_id = message.msg_id;
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::Forwarded);
    let messages = h.store.messages(QUEUE).await;
    assert_eq!(messages.len(), 1);
    let forwarded = &messages[0];
    assert_ne!(forwarded.msg_id, original_msg_id);
    assert_eq!(Some(forwarded.msg_id), report.forwarded_msg_id);
    assert_eq!(forwarded.stage, "qa");
    assert_eq!(forwarded.job_id, Some(job_id));
    assert_eq!(forwarded.payload, payload);
    assert_eq!(forwarded.priority, 7);

    // forwarding never touches the lifecycle of either stage
    let progress = h.tracker.stage_progress(job_id).await.unwrap();
    assert!(progress.stages.is_empty());
    assert!(progress.job.is_none());

    let kinds = event_kinds(&drain_lifecycle_events(&mut events));
    assert_eq!(kinds, vec![StageEventKind::StageForwarded]);
}

#[tokio::test]
async fn test_forwarding_follows_stage_routes() {
    let h = EngineHarness::new();
    let routes = HashMap::from([("publish".to_string(), "publishing".to_string())]);
    let runner = h.runner("research", completing()).with_config(StageRunnerConfig {
        routes,
        ..fast_runner_config()
    });

    let message = h.lease("publish", json!({"slug": "tidal"})).await;
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::Forwarded);
    assert_eq!(h.store.queue_length(QUEUE).await, 0);
    assert_eq!(h.store.queue_length("publishing").await, 1);
}

#[tokio::test]
async fn test_message_without_job_id_is_discarded() {
    let h = EngineHarness::new();
    let runner = h.runner("research", completing());

    h.store
        .enqueue_stage(QUEUE, None, "research", &json!({}), &EnqueueOptions::default())
        .await
        .unwrap();
    let message = h.store.dequeue_stage(QUEUE, 30).await.unwrap().unwrap();
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::Invalid);
    assert_eq!(report.job_id, None);
    assert_eq!(h.store.queue_length(QUEUE).await, 0);
    assert!(h.store.dead_letters(QUEUE).await.is_empty());
}

#[tokio::test]
async fn test_continuation_is_enqueued_before_acknowledging() {
    let h = EngineHarness::new();
    let runner = h.runner(
        "research",
        handler_fn(|ctx| async move {
            Ok(StageOutcome::Continue(
                ContinuationMessage::new("outline", json!({"notes": ctx.payload["topic"]}))
                    .on_queue("outlines"),
            ))
        }),
    );

    let message = h.lease("research", json!({"topic": "kelp"})).await;
    let job_id = message.job_id.unwrap();
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::Pending);
    assert_eq!(h.store.queue_length(QUEUE).await, 0);

    let next = h.store.messages("outlines").await;
    assert_eq!(next.len(), 1);
    assert_eq!(Some(next[0].msg_id), report.continuation_msg_id);
    assert_eq!(next[0].job_id, Some(job_id));
    assert_eq!(next[0].stage, "outline");
    assert_eq!(next[0].payload, json!({"notes": "kelp"}));

    // the stage itself is not complete yet
    let entry = h.tracker.stage_progress(job_id).await.unwrap().stages.remove(0);
    assert_eq!(entry.status, StageStatus::Processing);
}

#[tokio::test]
async fn test_failed_continuation_leaves_message_for_redelivery() {
    let store = Arc::new(InMemoryStageQueueStore::new());
    let flaky = Arc::new(FlakyQueueStore::new(store.clone()));
    flaky.fail_enqueue.store(true, Ordering::SeqCst);
    let h = EngineHarness::with_stores(
        store,
        flaky,
        Arc::new(InMemoryStageLifecycleStore::new()),
    );
    let runner = h.runner(
        "research",
        handler_fn(|_ctx| async {
            Ok(StageOutcome::Continue(ContinuationMessage::new(
                "outline",
                json!({}),
            )))
        }),
    );

    let message = h.lease("research", json!({})).await;
    let msg_id = message.msg_id;
    let result = runner.process_stage_message(message).await;

    assert!(matches!(result, Err(StageEngineError::Queue(_))));
    let messages = h.store.messages(QUEUE).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].msg_id, msg_id);
}

#[tokio::test]
async fn test_failed_requeue_falls_back_to_dead_letter() {
    let store = Arc::new(InMemoryStageQueueStore::new());
    let flaky = Arc::new(FlakyQueueStore::new(store.clone()));
    flaky.fail_requeue.store(true, Ordering::SeqCst);
    let h = EngineHarness::with_stores(
        store,
        flaky,
        Arc::new(InMemoryStageLifecycleStore::new()),
    );
    let runner = h.runner("research", failing_with(|| StageError::retryable("try again")));

    let message = h.lease("research", json!({"topic": "kelp"})).await;
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::DeadLettered);
    assert_eq!(report.dead_letter_reason, Some(DeadLetterReason::RequeueFailed));
    assert_eq!(h.store.queue_length(QUEUE).await, 0);
    let dead_letters = h.store.dead_letters(QUEUE).await;
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].failure_reason, "requeue_failed");
    assert_eq!(dead_letters[0].payload, json!({"topic": "kelp"}));
}

#[tokio::test]
async fn test_failed_dead_letter_is_an_error_and_keeps_the_message() {
    let store = Arc::new(InMemoryStageQueueStore::new());
    let flaky = Arc::new(FlakyQueueStore::new(store.clone()));
    flaky.fail_dead_letter.store(true, Ordering::SeqCst);
    let h = EngineHarness::with_stores(
        store,
        flaky,
        Arc::new(InMemoryStageLifecycleStore::new()),
    );
    let runner = h.runner("research", failing_with(|| StageError::fatal("unsupported locale")));

    let message = h.lease("research", json!({})).await;
    let msg_id = message.msg_id;
    let result = runner.process_stage_message(message).await;

    assert_err!(&result);
    assert!(matches!(result, Err(StageEngineError::Queue(_))));
    let messages = h.store.messages(QUEUE).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].msg_id, msg_id);
    assert!(h.store.dead_letters(QUEUE).await.is_empty());
}

#[tokio::test]
async fn test_unavailable_lifecycle_store_does_not_block_processing() {
    let store = Arc::new(InMemoryStageQueueStore::new());
    let h = EngineHarness::with_stores(
        store.clone(),
        store,
        Arc::new(UnavailableLifecycleStore),
    );

    let completed = h
        .runner("research", completing())
        .process_stage_message(h.lease("research", json!({})).await)
        .await;
    let completed = assert_ok!(completed);
    assert_eq!(completed.outcome, StageRunOutcome::Completed);
    assert_eq!(completed.attempt, Some(1));
    assert_eq!(h.store.queue_length(QUEUE).await, 0);

    let requeued = h
        .runner("research", failing_with(|| StageError::network(Some("ECONNRESET"), "socket hang up")))
        .process_stage_message(h.lease("research", json!({})).await)
        .await
        .unwrap();
    assert_eq!(requeued.outcome, StageRunOutcome::Requeued);
    // attempt synthesized from the read count
    assert_eq!(requeued.attempt, Some(1));
    assert_eq!(h.store.messages(QUEUE).await[0].delay_seconds(), 120);
}

#[tokio::test]
async fn test_unavailable_lifecycle_store_still_exhausts_the_attempt_budget() {
    let store = Arc::new(InMemoryStageQueueStore::new());
    let h = EngineHarness::with_stores(
        store.clone(),
        store,
        Arc::new(UnavailableLifecycleStore),
    );
    let runner = h.runner("research", failing_with(|| StageError::retryable("model overloaded")));

    let options = EnqueueOptions::default()
        .with_max_attempts(2)
        .with_retry_delay_seconds(0);
    let first = h
        .lease_with(Uuid::new_v4(), "research", json!({"topic": "kelp"}), &options)
        .await;
    let report = runner.process_stage_message(first).await.unwrap();
    assert_eq!(report.outcome, StageRunOutcome::Requeued);
    assert_eq!(report.attempt, Some(1));

    let second = h.store.dequeue_stage(QUEUE, 30).await.unwrap().unwrap();
    assert_eq!(second.prior_attempts, 1);
    let report = runner.process_stage_message(second).await.unwrap();

    assert_eq!(report.outcome, StageRunOutcome::DeadLettered);
    assert_eq!(report.attempt, Some(2));
    assert_eq!(
        report.dead_letter_reason,
        Some(DeadLetterReason::MaxAttemptsExceeded)
    );
    assert_eq!(h.store.queue_length(QUEUE).await, 0);
    assert_eq!(h.store.dead_letters(QUEUE).await[0].attempt_count, 2);
}

#[tokio::test]
async fn test_requeue_after_lost_lease_does_not_duplicate_the_message() {
    let h = EngineHarness::new();
    let runner = h.runner(
        "research",
        handler_fn(|ctx| async move {
            // the lease expires and another consumer settles the message
            ctx.queue
                .ack(&ctx.queue_name, ctx.msg_id)
                .await
                .map_err(|e| StageError::failure(e.to_string()))?;
            Err(StageError::retryable("upstream busy"))
        }),
    );

    let message = h.lease("research", json!({})).await;
    let result = runner.process_stage_message(message).await;

    assert!(matches!(
        result,
        Err(StageEngineError::Queue(QueueError::MessageNotFound { .. }))
    ));
    assert_eq!(h.store.queue_length(QUEUE).await, 0);
    assert!(h.store.dead_letters(QUEUE).await.is_empty());
}

#[tokio::test]
async fn test_handler_can_extend_its_lease() {
    let h = EngineHarness::new();
    let runner = h.runner(
        "write",
        handler_fn(|ctx| async move {
            let extended = ctx
                .extend_visibility(60)
                .await
                .map_err(|e| StageError::failure(e.to_string()))?;
            if extended {
                Ok(StageOutcome::Complete)
            } else {
                Err(StageError::fatal("lease lost"))
            }
        }),
    );

    let message = h.lease("write", json!({})).await;
    let report = runner.process_stage_message(message).await.unwrap();
    assert_eq!(report.outcome, StageRunOutcome::Completed);
}

#[tokio::test]
async fn test_attempt_count_grows_once_per_delivery() {
    let h = EngineHarness::new();
    let runner = h.runner("research", failing_with(|| StageError::retryable("busy")));
    let job_id = Uuid::new_v4();

    let first = h
        .lease_with(job_id, "research", json!({}), &EnqueueOptions::default())
        .await;
    runner.process_stage_message(first).await.unwrap();

    // second delivery arrives without waiting for the scheduled retry
    let second = h
        .lease_with(job_id, "research", json!({}), &EnqueueOptions::default())
        .await;
    let report = runner.process_stage_message(second).await.unwrap();
    assert_eq!(report.attempt, Some(2));

    let entry = h.tracker.stage_progress(job_id).await.unwrap().stages.remove(0);
    assert_eq!(entry.attempt_count, 2);
    // 60 s × 2^2
    let delays: Vec<i64> = h
        .store
        .messages(QUEUE)
        .await
        .iter()
        .map(|m| m.delay_seconds())
        .collect();
    assert!(delays.contains(&240));
}

#[tokio::test]
async fn test_producer_settings_shape_new_lifecycle_entries() {
    let h = EngineHarness::new();
    let runner = h.runner("research", failing_with(|| StageError::retryable("busy")));
    let job_id = Uuid::new_v4();

    let options = EnqueueOptions::default()
        .with_max_attempts(1)
        .with_retry_delay_seconds(10);
    let message = h.lease_with(job_id, "research", json!({}), &options).await;
    let report = runner.process_stage_message(message).await.unwrap();

    assert_eq!(
        report.dead_letter_reason,
        Some(DeadLetterReason::MaxAttemptsExceeded)
    );
    let entry = h.tracker.stage_progress(job_id).await.unwrap().stages.remove(0);
    assert_eq!(entry.max_attempts, 1);
    assert_eq!(entry.retry_delay_seconds, 10);
}

#[tokio::test]
async fn test_consumers_drive_a_two_stage_pipeline() {
    let h = EngineHarness::new();
    let research = StageConsumer::new(
        h.runner(
            "research",
            handler_fn(|ctx| async move {
                ctx.queue
                    .enqueue(
                        "outlines",
                        ctx.job_id,
                        "outline",
                        &ctx.payload,
                        &EnqueueOptions::default(),
                    )
                    .await
                    .map_err(|e| StageError::retryable(e.to_string()))?;
                Ok(StageOutcome::Complete)
            }),
        ),
        ConsumerConfig {
            batch_size: 10,
            ..ConsumerConfig::default()
        },
    );
    let outline = StageConsumer::new(
        StageRunner::new(
            "outline",
            "outlines",
            h.queue.clone(),
            h.tracker.clone(),
            Arc::new(completing()),
        )
        .with_config(fast_runner_config()),
        ConsumerConfig::default(),
    );

    let jobs: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    for job_id in &jobs {
        h.queue
            .enqueue(
                QUEUE,
                *job_id,
                "research",
                &json!({"job": job_id.to_string()}),
                &EnqueueOptions::default(),
            )
            .await
            .unwrap();
    }

    let stats = research.run_once().await.unwrap();
    assert_eq!(stats.leased, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.errors, 0);

    let stats = outline.run_once().await.unwrap();
    assert_eq!(stats.completed, 3);

    let idle = research.run_once().await.unwrap();
    assert_eq!(idle.leased, 0);

    for job_id in jobs {
        let progress = h.tracker.stage_progress(job_id).await.unwrap();
        let stages: Vec<(&str, StageStatus)> = progress
            .stages
            .iter()
            .map(|entry| (entry.stage.as_str(), entry.status))
            .collect();
        assert_eq!(
            stages,
            vec![
                ("outline", StageStatus::Completed),
                ("research", StageStatus::Completed),
            ]
        );
        assert_eq!(
            progress.job.unwrap().current_stage.as_deref(),
            Some("outline")
        );
    }

    let depth = h.queue.queue_depth(QUEUE).await.unwrap();
    assert_eq!(depth.total, 0);
    assert_eq!(depth.dead_lettered, 0);
}
