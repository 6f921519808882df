//! proptest strategies for retry configurations and stage errors.

use proptest::prelude::*;
use stage_engine::orchestration::StageError;
use stage_engine::retry::{BackoffStrategy, RetryConfig, RetryError};

pub fn backoff_strategy() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![
        Just(BackoffStrategy::Exponential),
        Just(BackoffStrategy::Linear),
        Just(BackoffStrategy::Fibonacci),
        Just(BackoffStrategy::Decorrelated),
    ]
}

pub fn retry_config() -> impl Strategy<Value = RetryConfig> {
    (
        backoff_strategy(),
        0u64..=5_000,
        0u64..=120_000,
        1.0f64..=4.0,
        any::<bool>(),
    )
        .prop_map(|(strategy, base, max, factor, jitter)| {
            RetryConfig::exponential(base, max)
                .with_strategy(strategy)
                .with_factor(factor)
                .with_jitter(jitter)
        })
}

fn message() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z ]{0,40}",
        Just("request timed out".to_string()),
        Just("Rate limit reached".to_string()),
        Just("ECONNREFUSED 10.0.0.1:443".to_string()),
        Just("invalid outline structure".to_string()),
    ]
}

fn code() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("ETIMEDOUT".to_string())),
        Just(Some("ECONNRESET".to_string())),
        Just(Some("VALIDATION".to_string())),
        "[A-Z_]{1,12}".prop_map(Some),
    ]
}

fn leaf_error() -> impl Strategy<Value = StageError> {
    prop_oneof![
        message().prop_map(StageError::fatal),
        message().prop_map(StageError::retryable),
        (100u16..=599, message()).prop_map(|(status, m)| StageError::http(status, m)),
        (code(), message()).prop_map(|(code, m)| StageError::network(code.as_deref(), m)),
        (message(), message()).prop_map(|(d, m)| StageError::circuit_open(d, m)),
        (message(), code(), proptest::collection::vec(message(), 0..3)).prop_map(
            |(m, code, causes)| {
                let mut error = StageError::failure(m);
                if let Some(code) = code {
                    error = error.with_code(code);
                }
                causes
                    .into_iter()
                    .fold(error, |error, cause| error.with_cause(cause))
            }
        ),
        Just(()).prop_map(|_| StageError::Cancelled),
    ]
}

/// Any stage error, including retry aggregates of leaf errors
pub fn stage_error() -> impl Strategy<Value = StageError> {
    prop_oneof![
        4 => leaf_error(),
        1 => proptest::collection::vec(leaf_error(), 1..4).prop_map(|failures| {
            StageError::Retry(RetryError::Exhausted {
                attempts: failures.len() as u32,
                failures,
            })
        }),
    ]
}
