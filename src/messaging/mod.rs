//! # Messaging Module
//!
//! Durable stage queue: priority and delay on enqueue, visibility-timeout
//! leasing, idempotent acknowledgement, delayed redelivery and dead-lettering.
//!
//! [`StageQueue`] is the facade used by the engine. It delegates to a
//! [`StageQueueStore`], implemented in memory ([`InMemoryStageQueueStore`])
//! and on PostgreSQL ([`PgStageQueueStore`]).

pub mod backing_store;
pub mod errors;
pub mod in_memory;
pub mod message;
pub mod postgres;
pub mod queue;

pub use backing_store::StageQueueStore;
pub use errors::{QueueError, QueueResult};
pub use in_memory::InMemoryStageQueueStore;
pub use message::*;
pub use postgres::PgStageQueueStore;
pub use queue::{validate_queue_name, StageQueue};
