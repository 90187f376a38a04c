use anyhow::{anyhow, Context, Result};
use colored::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::Commands;
use analysis_daemon::lifecycle::WorkerStatus;
use analysis_daemon::logging::install_crash_hook;
use analysis_daemon::{
    ClientConfig, DatabaseClient, ExecutableLauncher, StopSummary, Supervisor, WorkerConfig,
    WorkerKind, WorkerStartResult,
};
use code_analysis::config::SupervisorConfig;

/// Handles the supervisor-side commands of the CLI.
pub struct ServerManager {
    config: SupervisorConfig,
    supervisor: Supervisor,
}

impl ServerManager {
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let launcher = match &config.worker_program {
            Some(program) => ExecutableLauncher::new(program),
            None => ExecutableLauncher::current_exe()
                .context("Failed to locate the executable to launch workers from")?,
        };
        let launcher =
            launcher.with_base_args(["--log-level".to_string(), config.log_level.clone()]);
        let supervisor = Supervisor::new(
            config.lifecycle_settings(),
            config.socket_dir.clone(),
            Arc::new(launcher),
        );
        Ok(Self { config, supervisor })
    }

    pub async fn handle_command(&self, command: &Commands) -> Result<()> {
        match command {
            Commands::Start { kinds } => self.start(kinds).await,
            Commands::Stop { kinds, timeout } => self.stop(kinds, *timeout).await,
            Commands::Restart { kinds, timeout } => self.restart(kinds, *timeout).await,
            Commands::Status { format } => self.show_status(format).await,
            Commands::Serve => self.serve().await,
            Commands::Query { sql, params } => self.query(sql, params).await,
            Commands::Driver { .. } | Commands::Worker { .. } => Err(anyhow!(
                "worker entry points are handled before the supervisor starts"
            )),
        }
    }

    fn timeout(&self, secs: Option<u64>) -> Duration {
        secs.map(Duration::from_secs)
            .unwrap_or_else(|| self.config.stop_timeout())
    }

    async fn start_one(&self, config: WorkerConfig) -> Result<WorkerStartResult> {
        match config {
            WorkerConfig::DatabaseDriver(driver) => Ok(self.supervisor.driver().start(driver).await?),
            other => Ok(self.supervisor.workers().start(other).await),
        }
    }

    /// Register workers a previous invocation left running, so they can be
    /// stopped or inspected from here.
    async fn adopt(&self, configs: &[WorkerConfig]) {
        for config in configs {
            if let Some(pid) = self.supervisor.workers().adopt(config).await {
                info!("Found running {} (PID {})", config.kind(), pid);
            }
        }
    }

    async fn stop_kinds(&self, kinds: &[WorkerKind], timeout: Duration) -> StopSummary {
        let mut summary = StopSummary::default();
        let configs = self.config.worker_configs(kinds);
        // Reverse boot order: everything else, then the driver
        for config in configs.iter().rev() {
            let result = match config.kind() {
                WorkerKind::DatabaseDriver => self.supervisor.driver().stop(timeout).await,
                kind => self.supervisor.workers().stop(kind, timeout).await,
            };
            summary.merge(result);
        }
        summary
    }

    async fn start(&self, kinds: &[WorkerKind]) -> Result<()> {
        let mut failed = 0;
        for config in self.config.worker_configs(kinds) {
            let result = self.start_one(config).await?;
            if !result.success && result.pid.is_none() {
                failed += 1;
            }
            println!("{}", serde_json::to_string(&result)?);
        }
        if failed > 0 {
            return Err(anyhow!("{} worker(s) failed to start", failed));
        }
        Ok(())
    }

    async fn stop(&self, kinds: &[WorkerKind], timeout: Option<u64>) -> Result<()> {
        let configs = self.config.worker_configs(kinds);
        self.adopt(&configs).await;

        let summary = self.stop_kinds(kinds, self.timeout(timeout)).await;
        println!("{}", serde_json::to_string(&summary)?);
        if !summary.is_clean() {
            return Err(anyhow!(
                "{} worker(s) could not be stopped: {}",
                summary.failed,
                summary.errors.join("; ")
            ));
        }
        Ok(())
    }

    async fn restart(&self, kinds: &[WorkerKind], timeout: Option<u64>) -> Result<()> {
        let configs = self.config.worker_configs(kinds);
        self.adopt(&configs).await;

        let timeout = self.timeout(timeout);
        let mut failed = 0;
        for config in configs {
            let result = match config {
                WorkerConfig::DatabaseDriver(driver) => {
                    self.supervisor.driver().restart(driver, timeout).await?
                }
                other => self.supervisor.workers().restart(other, timeout).await,
            };
            if !result.success {
                failed += 1;
            }
            println!("{}", serde_json::to_string(&result)?);
        }
        if failed > 0 {
            return Err(anyhow!("{} worker(s) failed to restart", failed));
        }
        Ok(())
    }

    /// Ask the driver for its own view (queue depth, uptime).
    async fn driver_rpc_status(&self) -> Option<serde_json::Map<String, Value>> {
        let client_config = ClientConfig {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
        };
        let mut client =
            DatabaseClient::connect_with(self.config.driver_socket_path(), client_config)
                .await
                .ok()?;
        client.status().await.ok()
    }

    async fn show_status(&self, format: &str) -> Result<()> {
        let configs = self.config.worker_configs(&[]);
        self.adopt(&configs).await;

        let mut statuses: Vec<WorkerStatus> = Vec::new();
        for config in &configs {
            statuses.push(match config {
                WorkerConfig::DatabaseDriver(driver) => {
                    self.supervisor.driver().status(driver).await?
                }
                other => self.supervisor.workers().status(other).await,
            });
        }
        let driver = self.driver_rpc_status().await;

        match format {
            "json" => {
                let json_output = json!({
                    "project_root": self.config.project_root,
                    "storage_path": self.config.storage_path,
                    "socket_path": self.config.driver_socket_path(),
                    "workers": statuses,
                    "driver": driver,
                });
                println!("{}", serde_json::to_string_pretty(&json_output)?);
            }
            _ => self.print_status_text(&statuses, driver.as_ref()),
        }
        Ok(())
    }

    fn print_status_text(
        &self,
        statuses: &[WorkerStatus],
        driver: Option<&serde_json::Map<String, Value>>,
    ) {
        println!("{}", "Code Analysis Server Status".bold().green());
        println!(
            "  {} {}",
            "Project:".bold(),
            self.config.project_root.display().to_string().cyan()
        );
        println!(
            "  {} {}",
            "Storage:".bold(),
            self.config.storage_path.display().to_string().cyan()
        );
        println!(
            "  {} {}",
            "Socket:".bold(),
            self.config.driver_socket_path().display().to_string().dimmed()
        );

        println!("\n{}", "Workers:".bold());
        for status in statuses {
            let state = if status.is_running() {
                "running".green()
            } else {
                "stopped".red()
            };
            let pid = status
                .instances
                .iter()
                .find(|i| i.alive)
                .and_then(|i| i.pid)
                .or(status.pid_file_pid.filter(|_| status.pid_file_alive));
            match pid {
                Some(pid) => println!("  {:<18} {} (PID {})", status.kind.as_str(), state, pid),
                None => println!("  {:<18} {}", status.kind.as_str(), state),
            }
            if !status.pid_file_alive {
                if let Some(stale) = status.pid_file_pid {
                    println!(
                        "    {} PID file names PID {} which is not running",
                        "stale:".yellow(),
                        stale
                    );
                }
            }
            if let Some(lock) = &status.lock {
                println!(
                    "    {} PID {} on {} since {}",
                    "lock:".bold(),
                    lock.pid,
                    lock.hostname,
                    lock.created_at.to_rfc3339()
                );
                if let Some(reason) = &status.lock_stale {
                    println!("    {} {}", "stale lock:".yellow(), reason);
                }
            }
        }

        match driver {
            Some(driver) => {
                println!("\n{}", "Database Driver:".bold());
                for key in ["queue_capacity", "pending", "requests_served", "uptime_secs"] {
                    if let Some(value) = driver.get(key) {
                        println!("  {:<16} {}", format!("{key}:"), value);
                    }
                }
            }
            None => println!("\n{}", "Database driver is not responding".yellow()),
        }
    }

    /// Take over workers left running by an earlier invocation, then start
    /// whatever is missing. Adopted workers report `success = false` with
    /// their PID and are supervised like freshly started ones.
    async fn boot(&self, kinds: &[WorkerKind]) -> Result<Vec<WorkerStartResult>> {
        let configs = self.config.worker_configs(kinds);
        self.adopt(&configs).await;

        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            results.push(self.start_one(config).await?);
        }
        Ok(results)
    }

    async fn serve(&self) -> Result<()> {
        let crash_log = install_crash_hook(&self.config.log_dir, "code-analysis supervisor");
        info!("Crash reports go to {}", crash_log.display());

        for result in self.boot(&[]).await? {
            println!("{}", serde_json::to_string(&result)?);
        }

        let interval = self.config.monitor_interval();
        self.supervisor.monitor().start_monitoring(interval);
        eprintln!(
            "{} (monitor every {}s, Ctrl-C to stop)",
            "Code analysis server running".green(),
            interval.as_secs()
        );

        wait_for_shutdown_signal().await?;

        let summary = self.supervisor.shutdown(self.config.stop_timeout()).await;
        println!("{}", serde_json::to_string(&summary)?);
        if !summary.is_clean() {
            warn!("Shutdown left {} worker(s) running", summary.failed);
        }
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[String]) -> Result<()> {
        let mut client = DatabaseClient::for_storage(
            &self.config.storage_path,
            self.config.socket_dir.as_deref(),
        )
        .await?;
        let params = params.iter().map(String::as_str).map(parse_param).collect();
        let rows = client.execute(sql, params).await?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
        Ok(())
    }
}

/// A CLI parameter as a JSON value: numbers, booleans, null, arrays and
/// objects parse as JSON, anything else is a plain string.
pub fn parse_param(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(_)) | Err(_) => Value::String(raw.to_string()),
        Ok(value) => value,
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    info!("Shutdown requested, stopping workers");
    Ok(())
}
