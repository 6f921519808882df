//! # Stage Engine Configuration Validator
//!
//! Command-line tool for validating `stage-engine.yaml` across environments
//! before starting stage consumers.

use clap::{Parser, Subcommand};
use stage_engine::config::{ConfigManager, StageEngineConfig};
use stage_engine::resilience::CircuitBreakerConfig;
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const ENVIRONMENTS: [&str; 3] = ["development", "test", "production"];

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate stage engine configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print the merged configuration as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration for one environment
    Validate,

    /// Validate every known environment
    All,

    /// Show the effective queue routing table
    Routes,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _ = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) => validate_all_environments(&cli),
        Some(Commands::Routes) => show_routes(&cli),
        Some(Commands::Validate) | None => validate_environment(&cli, &cli.environment).map(|_| ()),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            process::exit(1);
        }
    }
}

fn load(cli: &Cli, environment: &str) -> Result<StageEngineConfig, Box<dyn std::error::Error>> {
    let manager = ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment)?;
    println!("✅ Loaded {}", manager.config_file().display());
    Ok(manager.config().clone())
}

fn validate_environment(
    cli: &Cli,
    environment: &str,
) -> Result<StageEngineConfig, Box<dyn std::error::Error>> {
    println!("🔧 Validating stage engine configuration");
    println!("Environment: {environment}");
    println!();

    let config = match load(cli, environment) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ {e}");
            return Err(e);
        }
    };

    print_summary(&config);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    println!("\n🎉 Configuration for '{environment}' is valid");
    Ok(config)
}

fn validate_all_environments(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut failures = Vec::new();
    for environment in ENVIRONMENTS {
        if let Err(e) = validate_environment(cli, environment) {
            failures.push(format!("{environment}: {e}"));
        }
        println!();
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; ").into())
    }
}

fn show_routes(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(cli, &cli.environment)?;
    println!("📬 Default queue: {}", config.queue.default_queue);

    let mut routes: Vec<_> = config.queue.routes.iter().collect();
    routes.sort();
    for (stage, queue_name) in routes {
        println!("  • {stage} → {queue_name}");
    }
    Ok(())
}

fn print_summary(config: &StageEngineConfig) {
    println!("📬 Queue");
    println!("   default queue: {}", config.queue.default_queue);
    println!(
        "   visibility: {}s, batch size: {}, poll interval: {}ms",
        config.queue.visibility_seconds, config.queue.batch_size, config.queue.poll_interval_ms
    );
    println!("   routes: {}", config.queue.routes.len());

    println!("🧭 Stage defaults");
    println!(
        "   max attempts: {}, retry delay: {}s, priority: {}, max backoff exponent: {}",
        config.stages.max_attempts,
        config.stages.retry_delay_seconds,
        config.stages.priority,
        config.stages.max_backoff_exponent
    );

    println!("🔁 Handler retry");
    match (config.retry.base_delay_ms, config.retry.max_delay_ms) {
        (Some(base), max) => println!(
            "   {} fixed base {}ms, max {}",
            config.retry.strategy.as_str(),
            base,
            max.map(|m| format!("{m}ms"))
                .unwrap_or_else(|| format!("{}x base", config.retry.cap_multiplier))
        ),
        (None, _) => println!(
            "   {} derived per stage (floor {}ms, cap {}x)",
            config.retry.strategy.as_str(),
            config.retry.min_base_delay_ms,
            config.retry.cap_multiplier
        ),
    }
    println!("   max attempts: {}", config.retry.max_attempts);

    println!("⚡ Circuit breakers");
    let default = config
        .circuit_breakers
        .default
        .as_ref()
        .map(|settings| settings.to_breaker_config())
        .unwrap_or_default();
    print_breaker("default", &default);
    let mut overrides: Vec<_> = config.circuit_breakers.overrides.iter().collect();
    overrides.sort_by(|a, b| a.0.cmp(b.0));
    for (dependency, settings) in overrides {
        print_breaker(dependency, &settings.to_breaker_config());
    }

    println!("🗄️  Database");
    if config.database.database_url().is_some() {
        println!("   ✅ URL configured");
    } else {
        println!("   ℹ️  No URL configured (in-memory stores only)");
    }
    println!("   max connections: {}", config.database.max_connections);
}

fn print_breaker(name: &str, config: &CircuitBreakerConfig) {
    println!(
        "   {name}: threshold {}, reset {}s, half-open {}, daily limit {}",
        config.failure_threshold,
        config.reset_timeout.as_secs(),
        config.half_open_requests,
        config
            .daily_limit
            .map(|limit| limit.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
}
