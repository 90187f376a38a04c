use anyhow::{anyhow, Context, Result};
use clap::Parser as ClapParser;
use std::path::Path;
use tracing::{error, info};

mod cli;
mod commands;

use analysis_daemon::logging::{init_file, init_stderr, install_crash_hook};
use analysis_daemon::{DatabaseDriver, WorkerConfig, WorkerKind};
use cli::{Args, Commands};
use code_analysis::config::SupervisorConfig;
use commands::ServerManager;

/// Log to the worker's file when it has one; spawned workers have no terminal.
fn init_worker_logging(level: &str, log_path: Option<&Path>, process: &str) -> Result<()> {
    match log_path {
        Some(path) => {
            init_file(level, path)?;
            if let Some(dir) = path.parent() {
                install_crash_hook(dir, process);
            }
        }
        None => init_stderr(level),
    }
    Ok(())
}

fn parse_worker_config(config_json: &str) -> Result<WorkerConfig> {
    serde_json::from_str(config_json).context("Invalid --config-json")
}

async fn run_driver(config_json: &str, level: &str) -> Result<()> {
    let WorkerConfig::DatabaseDriver(config) = parse_worker_config(config_json)? else {
        return Err(anyhow!("--config-json does not describe a database driver"));
    };
    init_worker_logging(level, config.log_path.as_deref(), "database driver")?;
    info!("Starting database driver (PID {})", std::process::id());

    let driver = DatabaseDriver::new(config)?;
    if let Err(e) = driver.run().await {
        error!("Database driver failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run_worker(kind: WorkerKind, config_json: &str, level: &str) -> Result<()> {
    let config = parse_worker_config(config_json)?;
    if config.kind() != kind {
        return Err(anyhow!(
            "--config-json describes a {} worker, not {}",
            config.kind(),
            kind
        ));
    }
    init_worker_logging(level, config.log_path(), kind.as_str())?;

    if let Err(e) = code_analysis::workers::run_worker(config).await {
        error!("{} worker failed: {:#}", kind, e);
        return Err(e);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = args.log_level.clone().unwrap_or_else(|| "info".to_string());

    // Entry points of spawned processes carry their whole configuration
    match &args.command {
        Commands::Driver { config_json } => return run_driver(config_json, &level).await,
        Commands::Worker { kind, config_json } => {
            return run_worker(*kind, config_json, &level).await
        }
        _ => {}
    }

    let mut config = SupervisorConfig::load(args.config.as_deref(), args.project_root.clone())?;
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    init_stderr(&config.log_level);

    ServerManager::new(config)?
        .handle_command(&args.command)
        .await
}
