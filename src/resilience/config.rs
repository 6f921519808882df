//! # Circuit Breaker Configuration
//!
//! Per-dependency breaker settings. Defaults come from a small lookup table
//! keyed by dependency name; YAML overrides are applied on top by
//! [`crate::resilience::CircuitBreakerRegistry`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Percentage of the daily limit at which a dependency is reported unavailable
pub const QUOTA_THRESHOLD_PERCENT: u64 = 95;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time to wait in open state before allowing trial calls
    pub reset_timeout: Duration,

    /// Trial calls allowed while half-open
    pub half_open_requests: u32,

    /// Optional daily call quota
    pub daily_limit: Option<u64>,
}

impl CircuitBreakerConfig {
    /// Defaults for a named dependency, falling back to generic settings
    pub fn for_dependency(dependency: &str) -> Self {
        Self::known_dependency(dependency).unwrap_or_else(|| Self::from_table(5, 3, 2))
    }

    /// Lookup-table entry for a dependency, if it has one
    pub fn known_dependency(dependency: &str) -> Option<Self> {
        let (failure_threshold, reset_minutes, half_open_requests) =
            match dependency.to_ascii_lowercase().as_str() {
                "openai" => (5, 2, 3),
                "anthropic" | "claude" => (3, 3, 2),
                "groq" => (5, 2, 2),
                "perplexity" => (3, 3, 1),
                "dataforseo" => (2, 5, 1),
                "firecrawl" | "scraper" => (3, 5, 1),
                "webhook" | "email" => (4, 2, 2),
                _ => return None,
            };

        Some(Self::from_table(
            failure_threshold,
            reset_minutes,
            half_open_requests,
        ))
    }

    fn from_table(failure_threshold: u32, reset_minutes: u64, half_open_requests: u32) -> Self {
        Self {
            failure_threshold,
            reset_timeout: Duration::from_secs(reset_minutes * 60),
            half_open_requests,
            daily_limit: None,
        }
    }

    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    pub fn with_half_open_requests(mut self, half_open_requests: u32) -> Self {
        self.half_open_requests = half_open_requests;
        self
    }

    pub fn with_daily_limit(mut self, daily_limit: u64) -> Self {
        self.daily_limit = Some(daily_limit);
        self
    }

    /// Usage at or above which the quota counts as exhausted
    pub fn quota_ceiling(&self) -> Option<u64> {
        self.daily_limit
            .map(|limit| limit.saturating_mul(QUOTA_THRESHOLD_PERCENT).div_ceil(100))
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.reset_timeout.is_zero() {
            return Err("reset_timeout must be greater than 0".to_string());
        }

        if self.reset_timeout > Duration::from_secs(3600) {
            return Err("reset_timeout should not exceed 3600 seconds".to_string());
        }

        if self.half_open_requests == 0 {
            return Err("half_open_requests must be greater than 0".to_string());
        }

        if self.daily_limit == Some(0) {
            return Err("daily_limit must be greater than 0 when set".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::for_dependency("default")
    }
}
