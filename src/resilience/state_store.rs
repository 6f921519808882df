//! # Circuit Breaker State Stores
//!
//! Breaker state lives in shared storage so every consumer of a dependency
//! observes the same view. Each transition is an independent load-then-save;
//! concurrent writers may race, which is acceptable for a damping mechanism.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use std::str::FromStr;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    #[default]
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - limited trial calls allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" | "half-open" => Ok(Self::HalfOpen),
            _ => Err(format!("Invalid circuit state: {s}")),
        }
    }
}

/// Persisted breaker record for one dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_attempts: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub daily_usage: u64,
    pub usage_date: Option<NaiveDate>,
}

impl CircuitBreakerState {
    /// Fresh closed record
    pub fn closed(dependency: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_attempts: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            daily_usage: 0,
            usage_date: None,
        }
    }

    /// Usage counted against today's quota
    pub fn usage_on(&self, today: NaiveDate) -> u64 {
        if self.usage_date == Some(today) {
            self.daily_usage
        } else {
            0
        }
    }
}

/// Errors raised by circuit state stores
#[derive(Debug, thiserror::Error)]
pub enum CircuitStoreError {
    #[error("Circuit state database error: {0}")]
    Database(String),

    #[error("Invalid circuit state record for {dependency}: {message}")]
    InvalidRecord { dependency: String, message: String },
}

impl From<sqlx::Error> for CircuitStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Shared storage for breaker records
#[async_trait]
pub trait CircuitStateStore: Send + Sync + fmt::Debug {
    async fn load(&self, dependency: &str) -> Result<Option<CircuitBreakerState>, CircuitStoreError>;

    async fn save(&self, state: &CircuitBreakerState) -> Result<(), CircuitStoreError>;
}

/// Process-local store, for tests and single-instance deployments
#[derive(Debug, Default)]
pub struct InMemoryCircuitStateStore {
    states: DashMap<String, CircuitBreakerState>,
}

impl InMemoryCircuitStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CircuitStateStore for InMemoryCircuitStateStore {
    async fn load(&self, dependency: &str) -> Result<Option<CircuitBreakerState>, CircuitStoreError> {
        Ok(self.states.get(dependency).map(|entry| entry.value().clone()))
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<(), CircuitStoreError> {
        self.states.insert(state.dependency.clone(), state.clone());
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CircuitBreakerRow {
    dependency: String,
    state: String,
    consecutive_failures: i32,
    half_open_attempts: i32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    daily_usage: i64,
    usage_date: Option<NaiveDate>,
}

impl TryFrom<CircuitBreakerRow> for CircuitBreakerState {
    type Error = CircuitStoreError;

    fn try_from(row: CircuitBreakerRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<CircuitState>()
            .map_err(|message| CircuitStoreError::InvalidRecord {
                dependency: row.dependency.clone(),
                message,
            })?;

        Ok(Self {
            dependency: row.dependency,
            state,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            half_open_attempts: row.half_open_attempts.max(0) as u32,
            last_failure_at: row.last_failure_at,
            last_success_at: row.last_success_at,
            opened_at: row.opened_at,
            daily_usage: row.daily_usage.max(0) as u64,
            usage_date: row.usage_date,
        })
    }
}

/// PostgreSQL store over the `stage_circuit_breakers` table
#[derive(Debug, Clone)]
pub struct PgCircuitStateStore {
    pool: PgPool,
}

impl PgCircuitStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CircuitStateStore for PgCircuitStateStore {
    async fn load(&self, dependency: &str) -> Result<Option<CircuitBreakerState>, CircuitStoreError> {
        let row = sqlx::query_as::<_, CircuitBreakerRow>(
            r#"
            SELECT dependency, state, consecutive_failures, half_open_attempts,
                   last_failure_at, last_success_at, opened_at, daily_usage, usage_date
            FROM stage_circuit_breakers
            WHERE dependency = $1
            "#,
        )
        .bind(dependency)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CircuitBreakerState::try_from).transpose()
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<(), CircuitStoreError> {
        sqlx::query(
            r#"
            INSERT INTO stage_circuit_breakers (
                dependency, state, consecutive_failures, half_open_attempts,
                last_failure_at, last_success_at, opened_at, daily_usage, usage_date, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (dependency) DO UPDATE SET
                state = EXCLUDED.state,
                consecutive_failures = EXCLUDED.consecutive_failures,
                half_open_attempts = EXCLUDED.half_open_attempts,
                last_failure_at = EXCLUDED.last_failure_at,
                last_success_at = EXCLUDED.last_success_at,
                opened_at = EXCLUDED.opened_at,
                daily_usage = EXCLUDED.daily_usage,
                usage_date = EXCLUDED.usage_date,
                updated_at = NOW()
            "#,
        )
        .bind(&state.dependency)
        .bind(state.state.as_str())
        .bind(i32::try_from(state.consecutive_failures).unwrap_or(i32::MAX))
        .bind(i32::try_from(state.half_open_attempts).unwrap_or(i32::MAX))
        .bind(state.last_failure_at)
        .bind(state.last_success_at)
        .bind(state.opened_at)
        .bind(i64::try_from(state.daily_usage).unwrap_or(i64::MAX))
        .bind(state.usage_date)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_state_parsing() {
        assert_eq!("half-open".parse::<CircuitState>().unwrap(), CircuitState::HalfOpen);
        assert_eq!("half_open".parse::<CircuitState>().unwrap(), CircuitState::HalfOpen);
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert!("broken".parse::<CircuitState>().is_err());
    }

    #[test]
    fn test_usage_resets_on_new_day() {
        let today = Utc::now().date_naive();
        let mut state = CircuitBreakerState::closed("dataforseo");
        state.daily_usage = 40;
        state.usage_date = today.pred_opt();

        assert_eq!(state.usage_on(today), 0);

        state.usage_date = Some(today);
        assert_eq!(state.usage_on(today), 40);
    }

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemoryCircuitStateStore::new();
        assert!(store.load("openai").await.unwrap().is_none());

        let mut state = CircuitBreakerState::closed("openai");
        state.consecutive_failures = 2;
        store.save(&state).await.unwrap();

        let loaded = store.load("openai").await.unwrap().unwrap();
        assert_eq!(loaded.consecutive_failures, 2);
    }
}
