//! # Circuit Breaker Implementation
//!
//! Store-backed breaker with three states: Closed (normal operation), Open
//! (failing fast) and HalfOpen (limited trial calls). Every gate decision and
//! every call outcome is a read-modify-write against a [`CircuitStateStore`],
//! so all consumers of a dependency share one view of its health.

use crate::resilience::state_store::{
    CircuitBreakerState, CircuitState, CircuitStateStore, CircuitStoreError,
};
use crate::resilience::CircuitBreakerConfig;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {dependency} (retry after {retry_after_seconds}s)")]
    CircuitOpen {
        dependency: String,
        retry_after_seconds: u64,
    },

    /// Daily quota is at or above the reporting threshold
    #[error("Daily quota exhausted for {dependency}: {used}/{limit}")]
    QuotaExhausted {
        dependency: String,
        used: u64,
        limit: u64,
    },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Outcome of the gate check before a call
enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
    OverQuota { used: u64, limit: u64 },
}

/// Circuit breaker for one named dependency
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    store: Arc<dyn CircuitStateStore>,
}

impl CircuitBreaker {
    pub fn new(
        dependency: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn CircuitStateStore>,
    ) -> Self {
        let dependency = dependency.into();
        debug!(
            dependency = %dependency,
            failure_threshold = config.failure_threshold,
            reset_timeout_seconds = config.reset_timeout.as_secs(),
            half_open_requests = config.half_open_requests,
            daily_limit = config.daily_limit,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            dependency,
            config,
            store,
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection
    pub async fn execute<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.admit().await {
            Admission::Allowed => {}
            Admission::Rejected { retry_after } => {
                debug!(
                    dependency = %self.dependency,
                    retry_after_seconds = retry_after.as_secs(),
                    "🔴 Call rejected, circuit open"
                );
                return Err(CircuitBreakerError::CircuitOpen {
                    dependency: self.dependency.clone(),
                    retry_after_seconds: retry_after.as_secs().max(1),
                });
            }
            Admission::OverQuota { used, limit } => {
                warn!(
                    dependency = %self.dependency,
                    used = used,
                    limit = limit,
                    "Daily quota exhausted, rejecting call"
                );
                return Err(CircuitBreakerError::QuotaExhausted {
                    dependency: self.dependency.clone(),
                    used,
                    limit,
                });
            }
        }

        let started = Instant::now();
        let result = operation().await;
        let duration = started.elapsed();

        let recorded = match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        };
        if let Err(store_error) = recorded {
            warn!(
                dependency = %self.dependency,
                error = %store_error,
                "Failed to persist circuit breaker outcome"
            );
        }

        debug!(
            dependency = %self.dependency,
            duration_ms = duration.as_millis() as u64,
            success = result.is_ok(),
            "Protected call finished"
        );

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Whether a call would currently be admitted, including the daily quota.
    ///
    /// Read-only: an elapsed open circuit reports available without moving to
    /// half-open.
    pub async fn is_available(&self) -> bool {
        let state = match self.store.load(&self.dependency).await {
            Ok(state) => state.unwrap_or_else(|| CircuitBreakerState::closed(&self.dependency)),
            Err(store_error) => {
                warn!(
                    dependency = %self.dependency,
                    error = %store_error,
                    "Circuit state unavailable, assuming closed"
                );
                return true;
            }
        };

        let now = Utc::now();
        if self.over_quota(&state, now).is_some() {
            return false;
        }

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.remaining_open_time(&state, now).is_zero(),
            CircuitState::HalfOpen => state.half_open_attempts < self.config.half_open_requests,
        }
    }

    /// Current persisted record (a fresh closed record when none exists)
    pub async fn state(&self) -> Result<CircuitBreakerState, CircuitStoreError> {
        self.load().await
    }

    /// Record a successful call made outside [`CircuitBreaker::execute`]
    pub async fn record_success(&self) -> Result<CircuitBreakerState, CircuitStoreError> {
        let mut state = self.load().await?;
        let now = Utc::now();
        let previous = state.state;

        state.consecutive_failures = 0;
        state.last_success_at = Some(now);
        increment_usage(&mut state, now);

        if previous != CircuitState::Closed {
            state.state = CircuitState::Closed;
            state.half_open_attempts = 0;
            state.opened_at = None;
            info!(
                dependency = %self.dependency,
                previous_state = %previous,
                "🟢 Circuit breaker closed (recovered)"
            );
        }

        self.store.save(&state).await?;
        Ok(state)
    }

    /// Record a failed call made outside [`CircuitBreaker::execute`]
    pub async fn record_failure(&self) -> Result<CircuitBreakerState, CircuitStoreError> {
        let mut state = self.load().await?;
        let now = Utc::now();

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(now);

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut state, now);
                }
            }
            CircuitState::HalfOpen => {
                // Any trial failure reopens immediately
                self.open(&mut state, now);
            }
            CircuitState::Open => {}
        }

        self.store.save(&state).await?;
        Ok(state)
    }

    /// Force the circuit open (for emergency situations)
    pub async fn force_open(&self) -> Result<(), CircuitStoreError> {
        warn!(dependency = %self.dependency, "🚨 Circuit breaker forced open");
        let mut state = self.load().await?;
        let now = Utc::now();
        state.last_failure_at = Some(now);
        self.open(&mut state, now);
        self.store.save(&state).await
    }

    /// Reset to a fresh closed record, keeping today's quota usage
    pub async fn reset(&self) -> Result<(), CircuitStoreError> {
        warn!(dependency = %self.dependency, "🚨 Circuit breaker reset");
        let current = self.load().await?;
        let mut state = CircuitBreakerState::closed(&self.dependency);
        state.daily_usage = current.daily_usage;
        state.usage_date = current.usage_date;
        state.last_success_at = current.last_success_at;
        self.store.save(&state).await
    }

    async fn load(&self) -> Result<CircuitBreakerState, CircuitStoreError> {
        Ok(self
            .store
            .load(&self.dependency)
            .await?
            .unwrap_or_else(|| CircuitBreakerState::closed(&self.dependency)))
    }

    /// Gate a call, persisting any state transition the gate causes.
    ///
    /// Store failures admit the call: the breaker only dampens load.
    async fn admit(&self) -> Admission {
        let mut state = match self.load().await {
            Ok(state) => state,
            Err(store_error) => {
                warn!(
                    dependency = %self.dependency,
                    error = %store_error,
                    "Circuit state unavailable, admitting call"
                );
                return Admission::Allowed;
            }
        };

        let now = Utc::now();
        if let Some((used, limit)) = self.over_quota(&state, now) {
            return Admission::OverQuota { used, limit };
        }

        let admission = match state.state {
            CircuitState::Closed => return Admission::Allowed,
            CircuitState::Open => {
                let remaining = self.remaining_open_time(&state, now);
                if !remaining.is_zero() {
                    return Admission::Rejected {
                        retry_after: remaining,
                    };
                }
                state.state = CircuitState::HalfOpen;
                state.half_open_attempts = 1;
                info!(
                    dependency = %self.dependency,
                    half_open_requests = self.config.half_open_requests,
                    "🟡 Circuit breaker half-open (testing recovery)"
                );
                Admission::Allowed
            }
            CircuitState::HalfOpen => {
                if state.half_open_attempts >= self.config.half_open_requests {
                    state.last_failure_at = Some(now);
                    self.open(&mut state, now);
                    Admission::Rejected {
                        retry_after: self.config.reset_timeout,
                    }
                } else {
                    state.half_open_attempts += 1;
                    Admission::Allowed
                }
            }
        };

        if let Err(store_error) = self.store.save(&state).await {
            warn!(
                dependency = %self.dependency,
                error = %store_error,
                "Failed to persist circuit breaker transition"
            );
        }

        admission
    }

    fn open(&self, state: &mut CircuitBreakerState, now: DateTime<Utc>) {
        state.state = CircuitState::Open;
        state.opened_at = Some(now);
        state.half_open_attempts = 0;

        error!(
            dependency = %self.dependency,
            consecutive_failures = state.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            reset_timeout_seconds = self.config.reset_timeout.as_secs(),
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    /// Time left before an open circuit may admit a trial call
    fn remaining_open_time(&self, state: &CircuitBreakerState, now: DateTime<Utc>) -> Duration {
        let Some(since) = state.last_failure_at.or(state.opened_at) else {
            return Duration::ZERO;
        };
        let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
        self.config.reset_timeout.saturating_sub(elapsed)
    }

    fn over_quota(&self, state: &CircuitBreakerState, now: DateTime<Utc>) -> Option<(u64, u64)> {
        let limit = self.config.daily_limit?;
        let ceiling = self.config.quota_ceiling()?;
        let used = state.usage_on(now.date_naive());
        (used >= ceiling).then_some((used, limit))
    }
}

fn increment_usage(state: &mut CircuitBreakerState, now: DateTime<Utc>) {
    let today = now.date_naive();
    state.daily_usage = state.usage_on(today).saturating_add(1);
    state.usage_date = Some(today);
}
