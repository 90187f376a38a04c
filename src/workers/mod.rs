//! Entry points of the worker processes the supervisor spawns.
//!
//! Each worker is a thin loop around the database client: the analysis
//! itself lives elsewhere, these loops only move rows of `file_changes`
//! through their stages.

pub mod file_watcher;
pub mod indexing;
pub mod vectorization;

use analysis_daemon::{ClientError, DatabaseClient, Statement, WorkerConfig};
use anyhow::Result;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(250);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Tables shared by all stages. Every worker runs this at connect time;
/// the statements are idempotent.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS file_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL,
        change_kind TEXT NOT NULL,
        mtime INTEGER,
        size INTEGER,
        detected_at TEXT NOT NULL,
        indexed INTEGER NOT NULL DEFAULT 0,
        indexed_at TEXT,
        vectorized INTEGER NOT NULL DEFAULT 0,
        vectorized_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_file_changes_stage ON file_changes (indexed, vectorized)",
];

/// Set once SIGTERM or SIGINT arrives; sleeping loops wake up immediately.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal on SIGTERM/SIGINT.
    pub fn install(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            }
            this.trigger();
        });
        Ok(())
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless shutdown comes first. Returns whether
    /// shutdown was requested.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        if self.is_requested() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = notified => {}
        }
        self.is_requested()
    }
}

/// Run the worker described by `config` until shutdown.
pub async fn run_worker(config: WorkerConfig) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    shutdown.install()?;

    match config {
        WorkerConfig::FileWatcher(cfg) => file_watcher::run(cfg, shutdown).await,
        WorkerConfig::Indexing(cfg) => run_stage(&indexing::IndexingStage, cfg, shutdown).await,
        WorkerConfig::Vectorization(cfg) => {
            run_stage(&vectorization::VectorizationStage, cfg, shutdown).await
        }
        WorkerConfig::DatabaseDriver(_) => Err(anyhow::anyhow!(
            "the database driver runs through the `driver` command, not as a worker"
        )),
    }
}

/// Connect to the driver, retrying with backoff until it answers or shutdown
/// is requested. Creates the shared tables on success.
pub async fn connect(socket_path: &Path, shutdown: &ShutdownSignal) -> Option<DatabaseClient> {
    let mut delay = RECONNECT_INITIAL_DELAY;
    loop {
        if shutdown.is_requested() {
            return None;
        }
        match DatabaseClient::connect(socket_path).await {
            Ok(mut client) => match ensure_schema(&mut client).await {
                Ok(()) => return Some(client),
                Err(e) => warn!("Connected but could not prepare tables: {}", e),
            },
            Err(e) => debug!("Driver not reachable yet: {}", e),
        }
        if shutdown.sleep(delay).await {
            return None;
        }
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
}

pub async fn ensure_schema(client: &mut DatabaseClient) -> Result<(), ClientError> {
    let statements = SCHEMA
        .iter()
        .map(|sql| Statement::new(*sql, vec![]))
        .collect();
    client.execute_batch(statements).await?;
    Ok(())
}

/// Whether an error means the connection is gone rather than the request
/// being rejected.
pub fn is_connection_error(err: &ClientError) -> bool {
    !matches!(err, ClientError::Remote { .. })
}

/// One processing stage over `file_changes`: pick pending rows, mark them done.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Query returning `id, path` of pending rows; takes the batch size as
    /// its only parameter.
    fn pending_sql(&self) -> &'static str;

    /// Update marking one row done; takes the completion timestamp and the id.
    fn complete_sql(&self) -> &'static str;
}

/// Process one batch. Returns how many rows were completed.
pub async fn process_batch(
    stage: &dyn Stage,
    client: &mut DatabaseClient,
    batch_size: usize,
) -> Result<usize, ClientError> {
    let rows = client
        .execute(stage.pending_sql(), vec![json!(batch_size)])
        .await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let now = chrono::Utc::now().to_rfc3339();
    let statements: Vec<Statement> = rows
        .iter()
        .filter_map(|row| row.get("id").cloned())
        .map(|id| Statement::new(stage.complete_sql(), vec![Value::from(now.as_str()), id]))
        .collect();
    let count = statements.len();
    client.execute_batch(statements).await?;
    debug!("{}: completed {} rows", stage.name(), count);
    Ok(count)
}

/// Poll loop shared by the indexing and vectorization workers.
pub async fn run_stage(
    stage: &dyn Stage,
    config: analysis_daemon::PollingWorkerConfig,
    shutdown: ShutdownSignal,
) -> Result<()> {
    info!(
        "{} worker started (PID {}, driver {})",
        stage.name(),
        std::process::id(),
        config.socket_path.display()
    );
    let interval = Duration::from_secs(config.poll_interval_secs.max(1));
    let mut client = None;
    let mut completed_total = 0usize;

    while !shutdown.is_requested() {
        if client.is_none() {
            client = connect(&config.socket_path, &shutdown).await;
            continue;
        }
        let Some(active) = client.as_mut() else {
            continue;
        };

        match process_batch(stage, active, config.batch_size).await {
            // A full batch likely means more is waiting
            Ok(n) if n >= config.batch_size => {
                completed_total += n;
                continue;
            }
            Ok(n) => completed_total += n,
            Err(e) if is_connection_error(&e) => {
                warn!("{}: lost driver connection: {}", stage.name(), e);
                client = None;
            }
            Err(e) => warn!("{}: batch failed: {}", stage.name(), e),
        }

        if shutdown.sleep(interval).await {
            break;
        }
    }

    info!(
        "{} worker stopped after completing {} rows",
        stage.name(),
        completed_total
    );
    Ok(())
}
