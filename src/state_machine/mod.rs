// Stage lifecycle state machine
//
// Tracks attempts, retry budget and timing for every (job, stage) pair and
// keeps a denormalized job summary alongside.

pub mod errors;
pub mod lifecycle;
pub mod persistence;
pub mod postgres;
pub mod states;

pub use errors::{LifecycleError, LifecycleResult};
pub use lifecycle::{
    retry_delay_seconds, FailureContext, JobProgress, JobSummary, JobUpdate, StageFailure,
    StageLifecycleEntry, StageLifecycleTracker, StageSettings, StageStartContext,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_EXPONENT, DEFAULT_PRIORITY,
    DEFAULT_RETRY_DELAY_SECONDS,
};
pub use persistence::{InMemoryStageLifecycleStore, StageLifecycleStore};
pub use postgres::PgStageLifecycleStore;
pub use states::{JobStatus, StageStatus};
