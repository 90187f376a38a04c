use analysis_daemon::{
    DriverConfig, FileWatcherConfig, LifecycleSettings, PollingWorkerConfig, SupervisorError,
    WorkerConfig, WorkerKind,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the project root holding config, logs and PID files.
pub const STATE_DIR_NAME: &str = ".code-analysis";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file contents. Every field is optional; missing ones take
/// defaults derived from the project root.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_wait_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_ready_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_dirs: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_poll_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_poll_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_settings: Option<BTreeMap<String, Value>>,
}

/// Fully resolved supervisor configuration with all paths absolute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorConfig {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub storage_path: PathBuf,
    pub socket_dir: Option<PathBuf>,
    pub monitor_interval_secs: u64,
    pub stop_timeout_secs: u64,
    pub kill_wait_ms: u64,
    pub driver_ready_delay_ms: u64,
    pub queue_capacity: usize,
    pub log_level: String,
    pub watch_dirs: Vec<PathBuf>,
    pub watch_poll_secs: u64,
    pub worker_poll_secs: u64,
    pub worker_batch_size: usize,
    pub worker_program: Option<PathBuf>,
    pub driver_settings: BTreeMap<String, Value>,
}

impl SupervisorConfig {
    /// Load configuration for `project_root` (the current directory when
    /// `None`). An explicit `config_path` must exist; the default location
    /// is optional.
    pub fn load(config_path: Option<&Path>, project_root: Option<PathBuf>) -> Result<Self> {
        let project_root = match project_root {
            Some(root) => root,
            None => env::current_dir().context("Failed to determine current directory")?,
        };
        let project_root = std::path::absolute(&project_root)
            .with_context(|| format!("Failed to resolve project root {project_root:?}"))?;

        let file = match config_path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = project_root.join(STATE_DIR_NAME).join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        let mut config = Self::resolve(project_root, file);
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<ConfigFile> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {path:?}"))?;
        let config: ConfigFile =
            toml::from_str(&content).context(format!("Failed to parse config file: {path:?}"))?;
        Ok(config)
    }

    /// Fill in defaults. Relative paths are taken relative to `project_root`.
    pub fn resolve(project_root: PathBuf, file: ConfigFile) -> Self {
        let rooted = |path: PathBuf| {
            if path.is_absolute() {
                path
            } else {
                project_root.join(path)
            }
        };

        let state_dir = file
            .state_dir
            .map(rooted)
            .unwrap_or_else(|| project_root.join(STATE_DIR_NAME));
        let log_dir = file
            .log_dir
            .map(rooted)
            .unwrap_or_else(|| state_dir.join("logs"));
        let pid_dir = file
            .pid_dir
            .map(rooted)
            .unwrap_or_else(|| state_dir.join("run"));
        let storage_path = file
            .storage_path
            .map(rooted)
            .unwrap_or_else(|| project_root.join("data").join("code_analysis.db"));
        let watch_dirs = file
            .watch_dirs
            .map(|dirs| dirs.into_iter().map(rooted).collect())
            .unwrap_or_else(|| vec![project_root.clone()]);

        Self {
            socket_dir: file.socket_dir.map(rooted),
            worker_program: file.worker_program.map(rooted),
            state_dir,
            log_dir,
            pid_dir,
            storage_path,
            watch_dirs,
            monitor_interval_secs: file.monitor_interval_secs.unwrap_or(10),
            stop_timeout_secs: file.stop_timeout_secs.unwrap_or(10),
            kill_wait_ms: file.kill_wait_ms.unwrap_or(2000),
            driver_ready_delay_ms: file.driver_ready_delay_ms.unwrap_or(500),
            queue_capacity: file.queue_capacity.unwrap_or(256),
            log_level: file.log_level.unwrap_or_else(|| "info".to_string()),
            watch_poll_secs: file.watch_poll_secs.unwrap_or(2),
            worker_poll_secs: file.worker_poll_secs.unwrap_or(5),
            worker_batch_size: file.worker_batch_size.unwrap_or(100),
            driver_settings: file.driver_settings.unwrap_or_default(),
            project_root,
        }
    }

    /// Apply `CODE_ANALYSIS_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CODE_ANALYSIS_STATE_DIR") {
            let state_dir = PathBuf::from(val);
            // Directories derived from the old state dir follow it
            if self.log_dir == self.state_dir.join("logs") {
                self.log_dir = state_dir.join("logs");
            }
            if self.pid_dir == self.state_dir.join("run") {
                self.pid_dir = state_dir.join("run");
            }
            self.state_dir = state_dir;
        }
        if let Ok(val) = env::var("CODE_ANALYSIS_STORAGE_PATH") {
            self.storage_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("CODE_ANALYSIS_SOCKET_DIR") {
            self.socket_dir = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }

    pub fn validate(&self) -> std::result::Result<(), SupervisorError> {
        let positive = [
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("stop_timeout_secs", self.stop_timeout_secs),
            ("kill_wait_ms", self.kill_wait_ms),
            ("watch_poll_secs", self.watch_poll_secs),
            ("worker_poll_secs", self.worker_poll_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SupervisorError::invalid_config(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.queue_capacity == 0 {
            return Err(SupervisorError::invalid_config(
                "queue_capacity must be greater than zero",
            ));
        }
        if self.worker_batch_size == 0 {
            return Err(SupervisorError::invalid_config(
                "worker_batch_size must be greater than zero",
            ));
        }
        if self.watch_dirs.is_empty() {
            return Err(SupervisorError::invalid_config(
                "watch_dirs must name at least one directory",
            ));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        let mut settings = LifecycleSettings::new(&self.pid_dir);
        settings.kill_wait = Duration::from_millis(self.kill_wait_ms);
        settings.driver_ready_delay = Duration::from_millis(self.driver_ready_delay_ms);
        settings
    }

    /// Socket of the driver that owns the configured storage file.
    pub fn driver_socket_path(&self) -> PathBuf {
        analysis_daemon::driver_socket_path(&self.storage_path, self.socket_dir.as_deref())
    }

    pub fn log_path(&self, kind: WorkerKind) -> PathBuf {
        self.log_dir.join(format!("{}.log", kind.as_str()))
    }

    pub fn watcher_lock_path(&self) -> PathBuf {
        self.pid_dir.join("file_watcher.lock")
    }

    pub fn driver_config(&self) -> DriverConfig {
        let mut driver = DriverConfig::sqlite(&self.storage_path);
        driver.driver_settings = self.driver_settings.clone();
        driver.socket_path = Some(self.driver_socket_path());
        driver.log_path = Some(self.log_path(WorkerKind::DatabaseDriver));
        driver.queue_capacity = self.queue_capacity;
        driver
    }

    /// Start configuration for one worker kind.
    pub fn worker_config(&self, kind: WorkerKind) -> WorkerConfig {
        let polling = || PollingWorkerConfig {
            socket_path: self.driver_socket_path(),
            poll_interval_secs: self.worker_poll_secs,
            batch_size: self.worker_batch_size,
            log_path: Some(self.log_path(kind)),
        };

        match kind {
            WorkerKind::DatabaseDriver => WorkerConfig::DatabaseDriver(self.driver_config()),
            WorkerKind::FileWatcher => WorkerConfig::FileWatcher(FileWatcherConfig {
                watch_dirs: self.watch_dirs.clone(),
                poll_interval_secs: self.watch_poll_secs,
                socket_path: self.driver_socket_path(),
                lock_path: self.watcher_lock_path(),
                log_path: Some(self.log_path(kind)),
            }),
            WorkerKind::Indexing => WorkerConfig::Indexing(polling()),
            WorkerKind::Vectorization => WorkerConfig::Vectorization(polling()),
        }
    }

    /// Configurations for `kinds` in boot order (all kinds when empty).
    pub fn worker_configs(&self, kinds: &[WorkerKind]) -> Vec<WorkerConfig> {
        WorkerKind::ALL
            .into_iter()
            .filter(|kind| kinds.is_empty() || kinds.contains(kind))
            .map(|kind| self.worker_config(kind))
            .collect()
    }
}
