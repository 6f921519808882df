//! # Backoff Strategies
//!
//! Pure delay computation. Every result is clamped to `[0, max_delay]`.
//!
//! | Strategy       | Delay for attempt `n` (0-based)                              |
//! |----------------|--------------------------------------------------------------|
//! | `exponential`  | `base × factor^n`                                            |
//! | `linear`       | `base × (n + 1)`                                             |
//! | `fibonacci`    | `base × fib(min(n, 11))` over `1,1,2,3,5,...,144`            |
//! | `decorrelated` | `max(base, rand(0, min(max, prev × 3)))`, `prev = base × 2^(n-1)` |
//!
//! Jitter (±25%) only applies to the first three strategies; decorrelated
//! jitter is already randomized.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Multipliers used by the fibonacci strategy
pub const FIBONACCI_SEQUENCE: [u64; 12] = [1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144];

/// Uniform jitter spread applied around a computed delay
pub const JITTER_FACTOR: f64 = 0.25;

/// Backoff algorithm used to space out retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fibonacci,
    /// AWS-style decorrelated jitter
    Decorrelated,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fibonacci => "fibonacci",
            Self::Decorrelated => "decorrelated",
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fibonacci" => Ok(Self::Fibonacci),
            "decorrelated" => Ok(Self::Decorrelated),
            _ => Err(format!("Invalid backoff strategy: {s}")),
        }
    }
}

/// Retry configuration for the in-process retry layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff algorithm
    pub strategy: BackoffStrategy,

    /// Base delay in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for any computed delay, in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor for the exponential strategy
    pub factor: f64,

    /// Apply ±25% jitter (ignored by the decorrelated strategy)
    pub jitter: bool,

    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: true,
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with factor 2 and jitter enabled
    pub fn exponential(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }

        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(format!(
                "factor must be a finite number >= 1.0 (got {})",
                self.factor
            ));
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) must not be lower than base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }

        Ok(())
    }
}

/// Source of uniformly distributed values in `[0, 1)`
pub trait RandomSource {
    fn next_f64(&mut self) -> f64;
}

impl RandomSource for fastrand::Rng {
    fn next_f64(&mut self) -> f64 {
        self.f64()
    }
}

/// Constant random source, for reproducible delay tables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&mut self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// Compute the delay before retrying after `attempt` (0-based) failures
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let mut rng = fastrand::Rng::new();
    compute_delay_with(attempt, config, &mut rng)
}

/// Compute a delay drawing randomness from `rng`
pub fn compute_delay_with<R>(attempt: u32, config: &RetryConfig, rng: &mut R) -> Duration
where
    R: RandomSource + ?Sized,
{
    let base = config.base_delay_ms as f64;
    let max = config.max_delay_ms as f64;
    let exponent = attempt.min(i32::MAX as u32) as i32;

    let raw = match config.strategy {
        BackoffStrategy::Exponential => base * config.factor.powi(exponent),
        BackoffStrategy::Linear => base * (f64::from(attempt) + 1.0),
        BackoffStrategy::Fibonacci => {
            let index = (attempt as usize).min(FIBONACCI_SEQUENCE.len() - 1);
            base * FIBONACCI_SEQUENCE[index] as f64
        }
        BackoffStrategy::Decorrelated => {
            let previous = if attempt > 0 {
                base * 2f64.powi(exponent - 1)
            } else {
                0.0
            };
            let upper = max.min(previous * 3.0);
            let sampled = rng.next_f64() * upper;
            return to_millis(sampled.max(base), max);
        }
    };

    let mut delay = raw.min(max);
    if config.jitter {
        let spread = delay * JITTER_FACTOR;
        delay += (rng.next_f64() * 2.0 - 1.0) * spread;
    }

    to_millis(delay, max)
}

fn to_millis(delay: f64, max: f64) -> Duration {
    let clamped = if delay.is_nan() {
        max
    } else {
        delay.round().clamp(0.0, max)
    };
    Duration::from_millis(clamped as u64)
}
