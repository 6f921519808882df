//! # Resilience Module
//!
//! Circuit breakers protecting calls to flaky external dependencies (language
//! model providers, scraping APIs, webhooks).
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: fail fast while a dependency is unhealthy, then
//!   probe recovery with a limited number of trial calls
//! - **State Stores**: breaker state is persisted per dependency name so that
//!   every consumer process observes the same view
//! - **Configuration**: a per-dependency lookup table, overridable from YAML
//! - **Quotas**: optional daily call limits reported through `is_available`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stage_engine::resilience::{CircuitBreakerRegistry, InMemoryCircuitStateStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CircuitBreakerRegistry::new(Arc::new(InMemoryCircuitStateStore::new()));
//! let breaker = registry.get("openai");
//!
//! let completion = breaker
//!     .execute(|| async { Ok::<_, std::io::Error>("generated outline") })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod registry;
pub mod state_store;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError};
pub use config::{CircuitBreakerConfig, QUOTA_THRESHOLD_PERCENT};
pub use registry::CircuitBreakerRegistry;
pub use state_store::{
    CircuitBreakerState, CircuitState, CircuitStateStore, CircuitStoreError,
    InMemoryCircuitStateStore, PgCircuitStateStore,
};
