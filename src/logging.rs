//! # Structured Logging Module
//!
//! Environment-aware structured console logging for stage consumers.
//!
//! The default level follows the deployment environment (`STAGE_ENGINE_ENV`,
//! then `APP_ENV`); `RUST_LOG` wins when set. `STAGE_ENGINE_LOG_FORMAT=json`
//! switches the console layer to JSON lines.

use std::io::IsTerminal;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("RUST_LOG")
            .ok()
            .filter(|directives| !directives.trim().is_empty())
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let format = log_format(std::env::var("STAGE_ENGINE_LOG_FORMAT").ok().as_deref());
        let ansi = std::io::stdout().is_terminal();

        let layer = match format {
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(filter.clone()))
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(ansi)
                .with_filter(EnvFilter::new(filter.clone()))
                .boxed(),
        };

        // An embedding application may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
            return;
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            filter = %filter,
            json = format == LogFormat::Json,
            "🔧 STRUCTURED LOGGING: Initialized console output"
        );
    });
}

/// Current environment from environment variables
pub fn get_environment() -> String {
    std::env::var("STAGE_ENGINE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
}

/// Default log level for an environment
pub fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

fn log_format(value: Option<&str>) -> LogFormat {
    match value {
        Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

/// Log structured data for a stage operation
pub fn log_stage_operation(
    operation: &str,
    job_id: Option<Uuid>,
    stage: Option<&str>,
    queue_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = job_id.map(|id| id.to_string()).as_deref(),
        stage = stage,
        queue_name = queue_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 STAGE_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_by_environment() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_log_format_selection() {
        assert_eq!(log_format(Some("json")), LogFormat::Json);
        assert_eq!(log_format(Some("JSON")), LogFormat::Json);
        assert_eq!(log_format(Some("pretty")), LogFormat::Pretty);
        assert_eq!(log_format(None), LogFormat::Pretty);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_stage_operation(
            "start_stage",
            Some(Uuid::new_v4()),
            Some("research"),
            Some("stages"),
            "processing",
            None,
        );
    }
}
