//! Loads the shipped `config/stage-engine.yaml` for every environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stage_engine::config::ConfigManager;
use stage_engine::resilience::InMemoryCircuitStateStore;
use stage_engine::retry::BackoffStrategy;
use stage_engine::state_machine::StageSettings;

fn shipped_config_dir() -> Option<PathBuf> {
    Some(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config"))
}

#[test]
fn test_every_environment_loads_and_validates() {
    for environment in ["development", "test", "production"] {
        let manager = ConfigManager::load_from_directory_with_env(shipped_config_dir(), environment)
            .unwrap_or_else(|e| panic!("{environment}: {e}"));

        assert_eq!(manager.environment(), environment);
        assert!(manager.config_file().ends_with("stage-engine.yaml"));
        manager.config().validate().unwrap();
        assert_eq!(manager.config().queue.default_queue, "stage_jobs");
    }
}

#[test]
fn test_environment_sections_override_the_base() {
    let development =
        ConfigManager::load_from_directory_with_env(shipped_config_dir(), "development").unwrap();
    let test = ConfigManager::load_from_directory_with_env(shipped_config_dir(), "test").unwrap();
    let production =
        ConfigManager::load_from_directory_with_env(shipped_config_dir(), "production").unwrap();

    assert_eq!(development.config().queue.poll_interval_ms, 500);
    assert_eq!(development.config().queue.batch_size, 5);

    assert_eq!(test.config().queue.visibility_seconds, 30);
    assert_eq!(test.config().database.max_connections, 5);
    assert_eq!(
        test.config().stage_settings(),
        StageSettings {
            max_attempts: 5,
            retry_delay_seconds: 1,
            priority: 0,
        }
    );

    assert_eq!(production.config().queue.batch_size, 10);
    assert_eq!(production.config().queue.poll_interval_ms, 1000);
    assert_eq!(production.config().database.max_connections, 25);
}

#[test]
fn test_runtime_settings_derive_from_loaded_config() {
    let manager = ConfigManager::load_from_directory_with_env(shipped_config_dir(), "test").unwrap();
    let config = manager.config();

    let consumer = config.consumer_config();
    assert_eq!(consumer.visibility_seconds, 30);
    assert_eq!(consumer.poll_interval(), Duration::from_millis(10));

    let runner = config.runner_config();
    assert_eq!(runner.visibility_seconds, 30);
    assert_eq!(runner.routes.get("publish").map(String::as_str), Some("publishing"));
    assert!(!runner.handler_retry.jitter);
    assert_eq!(runner.handler_retry.strategy, BackoffStrategy::Exponential);
    assert_eq!(runner.handler_retry.min_base_delay_ms, 1);
    assert_eq!(runner.handler_retry.cap_multiplier, 4);
    assert!(runner.handler_retry.fixed.is_none());

    assert_eq!(config.queue_for_stage("notify"), "notifications");
    assert_eq!(config.queue_for_stage("research"), "stage_jobs");
}

#[test]
fn test_breaker_registry_uses_configured_overrides() {
    let manager =
        ConfigManager::load_from_directory_with_env(shipped_config_dir(), "production").unwrap();
    let registry = manager
        .config()
        .circuit_breaker_registry(Arc::new(InMemoryCircuitStateStore::new()));

    let openai = registry.config_for("OpenAI");
    assert_eq!(openai.failure_threshold, 5);
    assert_eq!(openai.reset_timeout, Duration::from_secs(120));
    assert_eq!(openai.half_open_requests, 3);
    assert_eq!(openai.daily_limit, Some(50_000));

    // lookup table wins over the configured default
    let dataforseo = registry.config_for("dataforseo");
    assert_eq!(dataforseo.failure_threshold, 2);

    let unknown = registry.config_for("geocoder");
    assert_eq!(unknown.failure_threshold, 5);
    assert_eq!(unknown.reset_timeout, Duration::from_secs(180));
    assert_eq!(unknown.half_open_requests, 2);
    assert_eq!(unknown.daily_limit, None);
}

#[test]
fn test_debug_config_masks_connection_strings() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("stage-engine.yaml"),
        "database:\n  url: postgres://stage:hunter2@db/stage_engine\n",
    )
    .unwrap();

    let manager =
        ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test").unwrap();
    assert_eq!(
        manager.config().database.url.as_deref(),
        Some("postgres://stage:hunter2@db/stage_engine")
    );

    let rendered = manager.debug_config().to_string();
    assert!(!rendered.contains("hunter2"));
}
