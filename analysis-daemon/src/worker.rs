//! Worker kinds, per-kind start configuration and the value types returned
//! by lifecycle operations.

use crate::handle::WorkerHandle;
use crate::liveness::ProcessProbe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    FileWatcher,
    Vectorization,
    Indexing,
    DatabaseDriver,
}

impl WorkerKind {
    /// Boot order: the driver first, since every other worker talks to it.
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::DatabaseDriver,
        WorkerKind::FileWatcher,
        WorkerKind::Indexing,
        WorkerKind::Vectorization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::FileWatcher => "file_watcher",
            WorkerKind::Vectorization => "vectorization",
            WorkerKind::Indexing => "indexing",
            WorkerKind::DatabaseDriver => "database_driver",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "file_watcher" | "watcher" => Ok(WorkerKind::FileWatcher),
            "vectorization" | "vectorizer" => Ok(WorkerKind::Vectorization),
            "indexing" | "indexer" => Ok(WorkerKind::Indexing),
            "database_driver" | "driver" => Ok(WorkerKind::DatabaseDriver),
            other => Err(format!("unknown worker kind: {other}")),
        }
    }
}

/// Start parameters for the file watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWatcherConfig {
    pub watch_dirs: Vec<PathBuf>,
    pub poll_interval_secs: u64,
    /// Driver socket the watcher records changes through
    pub socket_path: PathBuf,
    /// Diagnostic lock file written by the watcher process
    pub lock_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Start parameters shared by the indexing and vectorization workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingWorkerConfig {
    pub socket_path: PathBuf,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Start parameters for the database driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub driver_type: String,
    #[serde(default)]
    pub driver_settings: BTreeMap<String, Value>,
    pub storage_path: PathBuf,
    /// Derived from `storage_path` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub queue_capacity: usize,
}

impl DriverConfig {
    pub fn sqlite(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            driver_type: "sqlite".to_string(),
            driver_settings: BTreeMap::new(),
            storage_path: storage_path.into(),
            socket_path: None,
            log_path: None,
            queue_capacity: 256,
        }
    }

    /// The configured socket path, or the one derived from the storage file.
    pub fn effective_socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| crate::socket_path::driver_socket_path(&self.storage_path, None))
    }

    /// Storage file stem, used to name the driver's PID file.
    pub fn storage_stem(&self) -> String {
        storage_stem(&self.storage_path)
    }
}

pub(crate) fn storage_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "storage".to_string())
}

/// Everything needed to start one worker, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerConfig {
    FileWatcher(FileWatcherConfig),
    Vectorization(PollingWorkerConfig),
    Indexing(PollingWorkerConfig),
    DatabaseDriver(DriverConfig),
}

impl WorkerConfig {
    pub fn kind(&self) -> WorkerKind {
        match self {
            WorkerConfig::FileWatcher(_) => WorkerKind::FileWatcher,
            WorkerConfig::Vectorization(_) => WorkerKind::Vectorization,
            WorkerConfig::Indexing(_) => WorkerKind::Indexing,
            WorkerConfig::DatabaseDriver(_) => WorkerKind::DatabaseDriver,
        }
    }

    /// Human-readable label for the worker instance.
    pub fn worker_name(&self) -> String {
        match self {
            WorkerConfig::FileWatcher(cfg) => {
                let dir = cfg
                    .watch_dirs
                    .first()
                    .and_then(|d| d.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "root".to_string());
                format!("file_watcher_{dir}")
            }
            WorkerConfig::DatabaseDriver(cfg) => format!("database_driver_{}", cfg.storage_stem()),
            other => other.kind().to_string(),
        }
    }

    /// Socket the worker serves (driver) or talks to (everything else).
    pub fn socket_path(&self) -> PathBuf {
        match self {
            WorkerConfig::FileWatcher(cfg) => cfg.socket_path.clone(),
            WorkerConfig::Vectorization(cfg) | WorkerConfig::Indexing(cfg) => {
                cfg.socket_path.clone()
            }
            WorkerConfig::DatabaseDriver(cfg) => cfg.effective_socket_path(),
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        match self {
            WorkerConfig::FileWatcher(cfg) => cfg.log_path.as_deref(),
            WorkerConfig::Vectorization(cfg) | WorkerConfig::Indexing(cfg) => {
                cfg.log_path.as_deref()
            }
            WorkerConfig::DatabaseDriver(cfg) => cfg.log_path.as_deref(),
        }
    }
}

/// What the monitor replays to bring a dead worker back: the exact
/// configuration of its last successful start, owned by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSpec {
    pub kind: WorkerKind,
    pub config: WorkerConfig,
}

impl RestartSpec {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            kind: config.kind(),
            config,
        }
    }
}

/// Outcome of a start or restart. "Already running" is reported here with
/// `success = false`, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStartResult {
    pub success: bool,
    #[serde(rename = "worker_type")]
    pub kind: WorkerKind,
    pub pid: Option<u32>,
    pub message: String,
}

impl WorkerStartResult {
    pub fn started(kind: WorkerKind, pid: u32, message: impl Into<String>) -> Self {
        Self {
            success: true,
            kind,
            pid: Some(pid),
            message: message.into(),
        }
    }

    pub fn failed(kind: WorkerKind, pid: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            kind,
            pid,
            message: message.into(),
        }
    }
}

/// Aggregate outcome of stopping every record of one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSummary {
    pub stopped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl StopSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    pub fn merge(&mut self, other: StopSummary) {
        self.stopped += other.stopped;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// One running worker instance as tracked by the registry.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub kind: WorkerKind,
    pub pid: Option<u32>,
    pub handle: Option<WorkerHandle>,
    pub name: String,
    pub socket_path: Option<PathBuf>,
    pub restart: Option<RestartSpec>,
    pub created_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(kind: WorkerKind, name: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            kind,
            pid,
            handle: None,
            name: name.into(),
            socket_path: None,
            restart: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_handle(mut self, handle: WorkerHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_socket_path(mut self, socket_path: PathBuf) -> Self {
        self.socket_path = Some(socket_path);
        self
    }

    pub fn with_restart(mut self, spec: RestartSpec) -> Self {
        self.restart = Some(spec);
        self
    }

    /// Liveness of this instance: the owned handle when it can answer,
    /// otherwise a PID probe.
    pub async fn is_alive(&self, probe: &dyn ProcessProbe) -> bool {
        match &self.handle {
            Some(WorkerHandle::Process(handle)) => match handle.is_running().await {
                Ok(running) => return running,
                Err(e) => debug!(
                    "Handle for {} unusable ({}), probing PID {:?}",
                    self.name, e, self.pid
                ),
            },
            Some(WorkerHandle::Stoppable(handle)) => {
                if let Some(running) = handle.is_running() {
                    return running;
                }
            }
            None => {}
        }

        match self.pid {
            Some(pid) => probe.is_alive(pid),
            // Nothing to check against; only a stoppable handle is assumed up
            None => matches!(self.handle, Some(WorkerHandle::Stoppable(_))),
        }
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("file-watcher".parse::<WorkerKind>(), Ok(WorkerKind::FileWatcher));
        assert_eq!("database_driver".parse::<WorkerKind>(), Ok(WorkerKind::DatabaseDriver));
        assert_eq!("Driver".parse::<WorkerKind>(), Ok(WorkerKind::DatabaseDriver));
        assert!("scheduler".parse::<WorkerKind>().is_err());
    }

    #[test]
    fn test_start_result_wire_shape() {
        let result = WorkerStartResult::started(WorkerKind::Indexing, 4242, "started");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "success": true,
                "worker_type": "indexing",
                "pid": 4242,
                "message": "started"
            })
        );

        let failed = WorkerStartResult::failed(WorkerKind::FileWatcher, None, "nope");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["pid"], Value::Null);
    }

    #[test]
    fn test_worker_names() {
        let watcher = WorkerConfig::FileWatcher(FileWatcherConfig {
            watch_dirs: vec![PathBuf::from("/srv/projects/alpha")],
            poll_interval_secs: 2,
            socket_path: PathBuf::from("/tmp/x.sock"),
            lock_path: PathBuf::from("/tmp/fw.lock"),
            log_path: None,
        });
        assert_eq!(watcher.worker_name(), "file_watcher_alpha");

        let driver = WorkerConfig::DatabaseDriver(DriverConfig::sqlite("/data/code_analysis.db"));
        assert_eq!(driver.worker_name(), "database_driver_code_analysis");
        assert_eq!(
            driver.socket_path(),
            PathBuf::from("/data/code_analysis_driver.sock")
        );
    }

    #[test]
    fn test_config_is_tagged_by_kind() {
        let config = WorkerConfig::Indexing(PollingWorkerConfig {
            socket_path: PathBuf::from("/tmp/db_driver.sock"),
            poll_interval_secs: 5,
            batch_size: 50,
            log_path: None,
        });
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "indexing");

        let back: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(RestartSpec::new(back).kind, WorkerKind::Indexing);
    }

    #[test]
    fn test_stop_summary_merge() {
        let mut total = StopSummary::default();
        total.merge(StopSummary {
            stopped: 2,
            failed: 1,
            errors: vec!["pid 7 survived".into()],
        });
        total.merge(StopSummary {
            stopped: 1,
            failed: 0,
            errors: vec![],
        });
        assert_eq!(total.stopped, 3);
        assert_eq!(total.failed, 1);
        assert!(!total.is_clean());
    }
}
