//! # Retry Executor
//!
//! Drives an async operation through repeated attempts. The attempt budget,
//! not wall-clock time, bounds the loop. Sleeps between attempts are tokio
//! timers and are interrupted by cancellation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::RetryError;
use super::strategy::{compute_delay_with, RetryConfig};

type ShouldRetryFn<E> = Arc<dyn Fn(&E, u32) -> bool + Send + Sync>;
type OnRetryFn<E> = Arc<dyn Fn(&E, u32, Duration) + Send + Sync>;

/// Hooks controlling a retry loop
pub struct RetryOptions<E> {
    should_retry: Option<ShouldRetryFn<E>>,
    on_retry: Option<OnRetryFn<E>>,
    cancellation: Option<CancellationToken>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            should_retry: None,
            on_retry: None,
            cancellation: None,
        }
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            should_retry: self.should_retry.clone(),
            on_retry: self.on_retry.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

impl<E> RetryOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a failure on `attempt` (0-based) may be retried
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Observe each scheduled retry: the failure, its attempt, and the delay
    pub fn with_on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&E, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Run `operation` until it succeeds, a failure is rejected by
/// `should_retry`, the attempt budget runs out, or cancellation is requested.
///
/// The operation receives the 0-based attempt number.
pub async fn run_with_retry<T, E, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    options: RetryOptions<E>,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut rng = fastrand::Rng::new();
    let mut failures = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        if options.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                failures,
            });
        }

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let retry_allowed = options
            .should_retry
            .as_ref()
            .map_or(true, |predicate| predicate(&error, attempt));

        if !retry_allowed {
            failures.push(error);
            return Err(RetryError::Aborted {
                attempts: attempt + 1,
                failures,
            });
        }

        if attempt + 1 >= max_attempts {
            failures.push(error);
            return Err(RetryError::Exhausted {
                attempts: attempt + 1,
                failures,
            });
        }

        let delay = compute_delay_with(attempt, config, &mut rng);
        if let Some(on_retry) = &options.on_retry {
            on_retry(&error, attempt, delay);
        }
        failures.push(error);

        debug!(
            attempt = attempt + 1,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis() as u64,
            strategy = %config.strategy,
            "Retrying operation after backoff"
        );

        match &options.cancellation {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(RetryError::Cancelled {
                            attempts: attempt + 1,
                            failures,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }

        attempt += 1;
    }
}

/// Per-operation result of [`run_batch`]
#[derive(Debug)]
pub enum BatchOutcome<T, E> {
    Success(T),
    Failure(RetryError<E>),
}

impl<T, E> BatchOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_result(self) -> Result<T, RetryError<E>> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(error) => Err(error),
        }
    }
}

impl<T, E> From<Result<T, RetryError<E>>> for BatchOutcome<T, E> {
    fn from(result: Result<T, RetryError<E>>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::Failure(error),
        }
    }
}

/// Run operations in chunks of `concurrency`, each under [`run_with_retry`].
///
/// Outcomes are returned in input order. A failing operation never affects
/// its siblings.
pub async fn run_batch<T, E, F, Fut>(
    operations: Vec<F>,
    config: &RetryConfig,
    concurrency: usize,
) -> Vec<BatchOutcome<T, E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let chunk_size = concurrency.max(1);
    let mut outcomes = Vec::with_capacity(operations.len());
    let mut remaining = operations.into_iter().peekable();

    while remaining.peek().is_some() {
        let chunk: Vec<F> = remaining.by_ref().take(chunk_size).collect();
        let results = join_all(
            chunk
                .into_iter()
                .map(|operation| run_with_retry(operation, config, RetryOptions::default())),
        )
        .await;
        outcomes.extend(results.into_iter().map(BatchOutcome::from));
    }

    outcomes
}
