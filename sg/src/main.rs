//! sg - seqgate scenario runner
//!
//! CLI entry point for replaying and validating scenario files.

use std::fs;
use std::path::Path;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use seqgate::cli::{Cli, Command, OutputFormat, get_log_path};
use seqgate::config::Config;
use seqgate::scenario::{Scenario, ScenarioRunner};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run {
            scenario,
            format,
            fallback_ms,
        } => {
            debug!(?scenario, %format, ?fallback_ms, "main: matched Run command");
            cmd_run(&config, &scenario, format, fallback_ms).await
        }
        Command::Validate { scenario } => {
            debug!(?scenario, "main: matched Validate command");
            cmd_validate(&scenario)
        }
    }
}

/// Replay a scenario and print what was observed
async fn cmd_run(config: &Config, path: &Path, format: OutputFormat, fallback_ms: Option<u64>) -> Result<()> {
    debug!(?path, %format, "cmd_run: called");
    let mut scenario = Scenario::load(path)?;
    if fallback_ms.is_some() {
        scenario.fallback_ms = fallback_ms;
    }

    for issue in scenario.validate() {
        warn!(%issue, "Scenario issue");
    }

    let report = ScenarioRunner::new(scenario, config.coordinator.clone()).run().await;

    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
            println!("{}", json);
        }
    }
    Ok(())
}

/// Report problems in a scenario without running it
fn cmd_validate(path: &Path) -> Result<()> {
    debug!(?path, "cmd_validate: called");
    let scenario = Scenario::load(path)?;
    let issues = scenario.validate();

    if issues.is_empty() {
        println!("Scenario '{}' is valid ({} tasks)", scenario.name, scenario.tasks.len());
        return Ok(());
    }

    for issue in &issues {
        println!("- {}", issue);
    }
    Err(eyre::eyre!("Scenario '{}' has {} issue(s)", scenario.name, issues.len()))
}
