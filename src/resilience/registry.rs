//! # Circuit Breaker Registry
//!
//! Hands out one breaker per dependency name. Configured overrides take
//! precedence over the built-in lookup table; every breaker shares the
//! registry's state store.

use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitStateStore};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    store: Arc<dyn CircuitStateStore>,
    default_config: Option<CircuitBreakerConfig>,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(store: Arc<dyn CircuitStateStore>) -> Self {
        Self {
            store,
            default_config: None,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Settings for dependencies with neither an override nor a table entry
    pub fn with_default_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.default_config = Some(config);
        self
    }

    pub fn with_override(mut self, dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(dependency.into().to_ascii_lowercase(), config);
        self
    }

    /// Effective configuration for a dependency
    pub fn config_for(&self, dependency: &str) -> CircuitBreakerConfig {
        let key = dependency.to_ascii_lowercase();
        if let Some(config) = self.overrides.get(&key) {
            return config.clone();
        }

        CircuitBreakerConfig::known_dependency(&key)
            .or_else(|| self.default_config.clone())
            .unwrap_or_else(|| CircuitBreakerConfig::for_dependency(&key))
    }

    /// Get or create the breaker for a dependency
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        let key = dependency.to_ascii_lowercase();
        if let Some(breaker) = self.breakers.get(&key) {
            return Arc::clone(breaker.value());
        }

        self.breakers
            .entry(key.clone())
            .or_insert_with(|| {
                info!(dependency = %key, "Created new circuit breaker");
                Arc::new(CircuitBreaker::new(
                    key.clone(),
                    self.config_for(&key),
                    Arc::clone(&self.store),
                ))
            })
            .clone()
    }

    /// Names of dependencies with a breaker handed out so far
    pub fn dependencies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}
