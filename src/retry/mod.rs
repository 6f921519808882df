//! # Retry Strategy Engine
//!
//! Backoff delay computation and retry execution for in-process retries.
//!
//! ## Overview
//!
//! Two layers live here:
//!
//! - [`strategy`]: pure delay computation under the exponential, linear,
//!   fibonacci and decorrelated-jitter algorithms. No I/O.
//! - [`executor`]: `run_with_retry` and `run_batch`, which drive an async
//!   operation through repeated attempts with cooperative (timer based) sleeps
//!   and cancellation.
//!
//! These retries are the *fast* retry layer, used inside a single handler
//! invocation. Cross-invocation retries (redelivery through the queue) are
//! scheduled by the stage lifecycle tracker with its own backoff formula.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stage_engine::retry::{run_with_retry, RetryConfig, RetryOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::exponential(250, 8_000).with_max_attempts(4);
//!
//! let value = run_with_retry(
//!     |_attempt| async { Ok::<_, std::io::Error>(42) },
//!     &config,
//!     RetryOptions::default(),
//! )
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod executor;
pub mod strategy;

pub use error::RetryError;
pub use executor::{run_batch, run_with_retry, BatchOutcome, RetryOptions};
pub use strategy::{
    compute_delay, compute_delay_with, BackoffStrategy, FixedRandom, RandomSource, RetryConfig,
    FIBONACCI_SEQUENCE, JITTER_FACTOR,
};
