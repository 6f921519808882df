//! Stage lifecycle events and metrics, delivered fire-and-forget to an
//! [`EventSink`].

pub mod publisher;
pub mod types;

pub use publisher::{EventSink, NoopEventSink, PublishError, StageEventPublisher, TracingEventSink};
pub use types::{MetricName, MetricTags, PublishedEvent, StageEvent, StageEventKind, StageMetric};
