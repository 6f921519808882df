use std::fmt::Debug;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::types::{PublishedEvent, StageEvent, StageMetric};

/// Error types for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Event channel is closed")]
    ChannelClosed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Event sink error: {0}")]
    Sink(String),
}

/// Fire-and-forget destination for lifecycle events and metrics.
///
/// The runner logs and ignores sink errors; a sink must never block message
/// processing.
pub trait EventSink: Send + Sync + Debug {
    fn emit_event(&self, event: &StageEvent) -> Result<(), PublishError>;

    fn record_metric(&self, metric: &StageMetric) -> Result<(), PublishError>;
}

/// Writes events and metrics to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit_event(&self, event: &StageEvent) -> Result<(), PublishError> {
        info!(
            event = %event.kind,
            job_id = %event.job_id,
            stage = %event.stage,
            attempt = ?event.attempt,
            priority = ?event.priority,
            queue_name = %event.queue_name,
            msg_id = event.msg_id,
            details = %event.details,
            "STAGE_EVENT"
        );
        Ok(())
    }

    fn record_metric(&self, metric: &StageMetric) -> Result<(), PublishError> {
        debug!(
            metric = metric.name.as_str(),
            value = metric.value,
            job_id = %metric.tags.job_id,
            stage = %metric.tags.stage,
            attempt = metric.tags.attempt,
            priority = metric.tags.priority,
            queue_latency_ms = metric.tags.queue_latency_ms,
            "STAGE_METRIC"
        );
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit_event(&self, _event: &StageEvent) -> Result<(), PublishError> {
        Ok(())
    }

    fn record_metric(&self, _metric: &StageMetric) -> Result<(), PublishError> {
        Ok(())
    }
}

/// High-throughput broadcast publisher for lifecycle events and metrics
#[derive(Debug, Clone)]
pub struct StageEventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

impl StageEventPublisher {
    /// Create a new publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: PublishedEvent) -> Result<(), PublishError> {
        // No subscribers is not an error; events are published even if no one listens
        let _ = self.sender.send(event);
        Ok(())
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StageEventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventSink for StageEventPublisher {
    fn emit_event(&self, event: &StageEvent) -> Result<(), PublishError> {
        self.publish(PublishedEvent::Lifecycle(event.clone()))
    }

    fn record_metric(&self, metric: &StageMetric) -> Result<(), PublishError> {
        self.publish(PublishedEvent::Metric(metric.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StageEventKind;
    use uuid::Uuid;

    fn event() -> StageEvent {
        StageEvent::new(StageEventKind::StageStarted, Uuid::new_v4(), "research", "stages", 1)
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let publisher = StageEventPublisher::new(8);
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(publisher.emit_event(&event()).is_ok());
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let publisher = StageEventPublisher::default();
        let mut receiver = publisher.subscribe();

        let sent = event();
        publisher.emit_event(&sent).unwrap();

        match receiver.recv().await.unwrap() {
            PublishedEvent::Lifecycle(received) => assert_eq!(received, sent),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
