//! # Stage Engine Configuration
//!
//! YAML-based configuration with per-environment overrides. A single file,
//! `config/stage-engine.yaml`, carries the base settings; its `development`,
//! `test` and `production` sections are deep-merged over the base for the
//! detected environment.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stage_engine::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//!
//! let consumer = manager.config().consumer_config();
//! let stage_defaults = manager.config().stage_settings();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::messaging::validate_queue_name;
use crate::orchestration::{ConsumerConfig, HandlerRetryPolicy, StageRunnerConfig};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitStateStore};
use crate::retry::{BackoffStrategy, RetryConfig};
use crate::state_machine::{
    StageSettings, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_EXPONENT, DEFAULT_PRIORITY,
    DEFAULT_RETRY_DELAY_SECONDS,
};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring stage-engine.yaml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StageEngineConfig {
    /// Queue names, leases and routing
    pub queue: QueueConfig,

    /// Defaults for newly created lifecycle entries
    pub stages: StageDefaultsConfig,

    /// In-process handler retries
    pub retry: RetryPolicyConfig,

    /// Per-dependency circuit breakers
    pub circuit_breakers: CircuitBreakersConfig,

    /// PostgreSQL connection
    pub database: DatabaseConfig,

    /// Resolved environment name, set by the loader
    #[serde(skip_deserializing)]
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_queue: String,
    pub visibility_seconds: u32,
    pub batch_size: u32,
    pub poll_interval_ms: u64,
    /// stage → queue
    pub routes: HashMap<String, String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_queue: "stage_jobs".to_string(),
            visibility_seconds: 300,
            batch_size: 5,
            poll_interval_ms: 1_000,
            routes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StageDefaultsConfig {
    pub max_attempts: u32,
    pub retry_delay_seconds: u32,
    pub priority: i32,
    pub max_backoff_exponent: u32,
}

impl Default for StageDefaultsConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECONDS,
            priority: DEFAULT_PRIORITY,
            max_backoff_exponent: DEFAULT_MAX_BACKOFF_EXPONENT,
        }
    }
}

/// Handler retry settings.
///
/// Without `base_delay_ms` the runner derives a configuration per stage from
/// the entry's `retry_delay_seconds` (floored at `min_base_delay_ms`, capped
/// at `cap_multiplier` × base). With it, every attempt uses the fixed
/// base/max pair.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub factor: f64,
    pub jitter: bool,
    pub max_attempts: u32,
    pub min_base_delay_ms: u64,
    pub cap_multiplier: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        let policy = HandlerRetryPolicy::default();
        Self {
            strategy: policy.strategy,
            base_delay_ms: None,
            max_delay_ms: None,
            factor: policy.factor,
            jitter: policy.jitter,
            max_attempts: policy.max_attempts,
            min_base_delay_ms: policy.min_base_delay_ms,
            cap_multiplier: policy.cap_multiplier,
        }
    }
}

impl RetryPolicyConfig {
    pub fn to_handler_retry_policy(&self) -> HandlerRetryPolicy {
        let fixed = self.base_delay_ms.map(|base| {
            let max = self
                .max_delay_ms
                .unwrap_or_else(|| base.saturating_mul(self.cap_multiplier.max(1)));
            RetryConfig::exponential(base, max)
                .with_strategy(self.strategy)
                .with_factor(self.factor)
                .with_jitter(self.jitter)
                .with_max_attempts(self.max_attempts)
        });

        HandlerRetryPolicy {
            strategy: self.strategy,
            factor: self.factor,
            jitter: self.jitter,
            max_attempts: self.max_attempts,
            min_base_delay_ms: self.min_base_delay_ms,
            cap_multiplier: self.cap_multiplier,
            fixed,
        }
    }
}

/// YAML shape of one breaker's settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_seconds: u64,
    pub half_open_requests: u32,
    #[serde(default)]
    pub daily_limit: Option<u64>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for CircuitBreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            reset_timeout_seconds: config.reset_timeout.as_secs(),
            half_open_requests: config.half_open_requests,
            daily_limit: config.daily_limit,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_secs(self.reset_timeout_seconds),
            half_open_requests: self.half_open_requests,
            daily_limit: self.daily_limit,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakersConfig {
    /// Used for dependencies with neither an override nor a table entry
    pub default: Option<CircuitBreakerSettings>,
    /// Per-dependency overrides, keyed by dependency name
    pub overrides: HashMap<String, CircuitBreakerSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL; `DATABASE_URL` is used when absent
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl DatabaseConfig {
    /// Configured URL, falling back to `DATABASE_URL`
    pub fn database_url(&self) -> Option<String> {
        self.url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

impl StageEngineConfig {
    /// Defaults for [`crate::state_machine::StageLifecycleTracker`]
    pub fn stage_settings(&self) -> StageSettings {
        StageSettings {
            max_attempts: self.stages.max_attempts,
            retry_delay_seconds: self.stages.retry_delay_seconds,
            priority: self.stages.priority,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            visibility_seconds: self.queue.visibility_seconds,
            batch_size: self.queue.batch_size,
            poll_interval_ms: self.queue.poll_interval_ms,
        }
    }

    pub fn runner_config(&self) -> StageRunnerConfig {
        StageRunnerConfig {
            visibility_seconds: self.queue.visibility_seconds,
            handler_retry: self.retry.to_handler_retry_policy(),
            routes: self.queue.routes.clone(),
        }
    }

    /// Queue a stage's messages belong on
    pub fn queue_for_stage(&self, stage: &str) -> &str {
        self.queue
            .routes
            .get(stage)
            .map(String::as_str)
            .unwrap_or(self.queue.default_queue.as_str())
    }

    /// Breaker registry over `store` with the configured default and overrides
    pub fn circuit_breaker_registry(
        &self,
        store: std::sync::Arc<dyn CircuitStateStore>,
    ) -> CircuitBreakerRegistry {
        let mut registry = CircuitBreakerRegistry::new(store);
        if let Some(default) = &self.circuit_breakers.default {
            registry = registry.with_default_config(default.to_breaker_config());
        }
        for (dependency, settings) in &self.circuit_breakers.overrides {
            registry = registry.with_override(dependency.clone(), settings.to_breaker_config());
        }
        registry
    }

    /// Validate configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_queue_name(&self.queue.default_queue).map_err(|e| {
            ConfigurationError::invalid_value(
                "queue.default_queue",
                self.queue.default_queue.clone(),
                e.to_string(),
            )
        })?;

        for (stage, queue_name) in &self.queue.routes {
            if stage.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    "queue.routes",
                    queue_name.clone(),
                    "route stage names must not be empty",
                ));
            }
            validate_queue_name(queue_name).map_err(|e| {
                ConfigurationError::invalid_value(
                    format!("queue.routes.{stage}"),
                    queue_name.clone(),
                    e.to_string(),
                )
            })?;
        }

        if self.queue.visibility_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.visibility_seconds",
                "0",
                "visibility timeout must be greater than 0",
            ));
        }

        if self.queue.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.batch_size",
                "0",
                "batch size must be greater than 0",
            ));
        }

        if self.stages.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "stages.max_attempts",
                "0",
                "stages need at least one attempt",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                "0",
                "handler retries need at least one attempt",
            ));
        }

        if !(self.retry.factor.is_finite() && self.retry.factor >= 1.0) {
            return Err(ConfigurationError::invalid_value(
                "retry.factor",
                self.retry.factor.to_string(),
                "factor must be a finite number of at least 1.0",
            ));
        }

        if let (Some(base), Some(max)) = (self.retry.base_delay_ms, self.retry.max_delay_ms) {
            if max < base {
                return Err(ConfigurationError::invalid_value(
                    "retry.max_delay_ms",
                    max.to_string(),
                    format!("max delay must be at least base_delay_ms ({base})"),
                ));
            }
        }

        if let Some(default) = &self.circuit_breakers.default {
            default.to_breaker_config().validate().map_err(|reason| {
                ConfigurationError::invalid_value(
                    "circuit_breakers.default",
                    format!("{default:?}"),
                    reason,
                )
            })?;
        }

        for (dependency, settings) in &self.circuit_breakers.overrides {
            settings.to_breaker_config().validate().map_err(|reason| {
                ConfigurationError::invalid_value(
                    format!("circuit_breakers.overrides.{dependency}"),
                    format!("{settings:?}"),
                    reason,
                )
            })?;
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "0",
                "pool size must be greater than 0",
            ));
        }

        Ok(())
    }
}
