mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use agora_backend::config::AppConfig;
use cli::Cli;

const DEFAULT_LOG_FILTER: &str = "info,agora=debug,agora_backend=debug";

/// Stderr plus a daily-rotated file under `log_dir`. The guard must live
/// until exit so buffered file lines get flushed.
fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "runner.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.to_string_lossy().to_string();
    }

    let _log_guard = init_logging(&config.log_dir())?;
    let config_path = AppConfig::resolve_path(cli.config.as_deref());
    if config_path.exists() {
        tracing::info!("Loaded config from {:?}", config_path);
    } else {
        tracing::warn!("No config file at {:?}, using defaults + env vars", config_path);
    }
    for entry in &config.ignored_env {
        tracing::warn!("Ignoring unparseable environment override {:?}", entry);
    }
    tracing::info!("Agora starting (data dir {:?})", config.data_dir());

    cli::run(cli.command, config).await
}
