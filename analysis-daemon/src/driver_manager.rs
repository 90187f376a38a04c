//! Lifecycle of the database driver worker.

use crate::client::{ClientConfig, DatabaseClient};
use crate::error::SupervisorError;
use crate::ipc::is_listening;
use crate::lifecycle::{WorkerManager, WorkerStatus};
use crate::socket_path::{driver_socket_path, remove_socket_file, validate_socket_path};
use crate::worker::{DriverConfig, StopSummary, WorkerConfig, WorkerKind, WorkerStartResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct DriverManager {
    workers: Arc<WorkerManager>,
    socket_dir: Option<PathBuf>,
}

impl DriverManager {
    pub fn new(workers: Arc<WorkerManager>, socket_dir: Option<PathBuf>) -> Self {
        Self {
            workers,
            socket_dir,
        }
    }

    /// Socket the driver for `storage_path` listens on.
    pub fn socket_path_for(&self, storage_path: &Path) -> PathBuf {
        driver_socket_path(storage_path, self.socket_dir.as_deref())
    }

    /// Fill in the socket path and check the parts of `config` that would
    /// otherwise only fail inside the spawned driver.
    pub fn prepare(&self, mut config: DriverConfig) -> Result<DriverConfig, SupervisorError> {
        if config.driver_type != "sqlite" {
            return Err(SupervisorError::invalid_config(format!(
                "unsupported driver_type {:?}",
                config.driver_type
            )));
        }
        if config.queue_capacity == 0 {
            return Err(SupervisorError::invalid_config(
                "queue_capacity must be at least 1",
            ));
        }
        let socket = match config.socket_path.take() {
            Some(socket) => socket,
            None => self.socket_path_for(&config.storage_path),
        };
        validate_socket_path(&socket)
            .map_err(|e| SupervisorError::invalid_config(e.to_string()))?;
        config.socket_path = Some(socket);
        Ok(config)
    }

    pub async fn start(&self, config: DriverConfig) -> Result<WorkerStartResult, SupervisorError> {
        let config = self.prepare(config)?;
        let socket = config.effective_socket_path();

        if is_listening(&socket, Duration::from_millis(500)).await {
            // One driver per socket, whether or not this supervisor started it
            let status = self
                .workers
                .status(&WorkerConfig::DatabaseDriver(config.clone()))
                .await;
            let pid = status.pid_file_pid.filter(|_| status.pid_file_alive);
            info!("A database driver is already serving {:?} (PID {:?})", socket, pid);
            return Ok(WorkerStartResult::failed(
                WorkerKind::DatabaseDriver,
                pid,
                format!("a database driver is already serving {}", socket.display()),
            ));
        }

        Ok(self.workers.start(WorkerConfig::DatabaseDriver(config)).await)
    }

    /// Stop the driver, then remove its socket file if nothing listens on it.
    pub async fn stop(&self, timeout: Duration) -> StopSummary {
        let sockets: Vec<PathBuf> = self
            .workers
            .registry()
            .get(WorkerKind::DatabaseDriver)
            .into_iter()
            .filter_map(|record| record.socket_path)
            .collect();

        let summary = self.workers.stop(WorkerKind::DatabaseDriver, timeout).await;

        for socket in sockets {
            if socket.exists() && !is_listening(&socket, Duration::from_millis(200)).await {
                info!("Removing leftover driver socket {:?}", socket);
                if let Err(e) = remove_socket_file(&socket) {
                    warn!("Failed to remove leftover driver socket {:?}: {}", socket, e);
                }
            }
        }
        summary
    }

    pub async fn restart(
        &self,
        config: DriverConfig,
        timeout: Duration,
    ) -> Result<WorkerStartResult, SupervisorError> {
        let config = self.prepare(config)?;
        self.stop(timeout).await;
        Ok(self.workers.start(WorkerConfig::DatabaseDriver(config)).await)
    }

    pub async fn status(&self, config: &DriverConfig) -> Result<WorkerStatus, SupervisorError> {
        let config = self.prepare(config.clone())?;
        Ok(self.workers.status(&WorkerConfig::DatabaseDriver(config)).await)
    }

    /// Whether the driver for `config` answers a ping.
    pub async fn is_responsive(&self, config: &DriverConfig) -> bool {
        let socket = match &config.socket_path {
            Some(socket) => socket.clone(),
            None => self.socket_path_for(&config.storage_path),
        };
        let client_config = ClientConfig {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
        };
        match DatabaseClient::connect_with(&socket, client_config).await {
            Ok(mut client) => client.ping().await.is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ExecutableLauncher;
    use crate::lifecycle::LifecycleSettings;
    use crate::liveness::SystemProbe;
    use crate::registry::WorkerRegistry;
    use crate::worker::WorkerRecord;
    use tempfile::tempdir;

    fn manager(dir: &Path, socket_dir: Option<PathBuf>) -> DriverManager {
        let workers = WorkerManager::new(
            Arc::new(WorkerRegistry::new()),
            Arc::new(SystemProbe::new()),
            Arc::new(ExecutableLauncher::new("/bin/false")),
            LifecycleSettings::new(dir.join("run")),
        );
        DriverManager::new(Arc::new(workers), socket_dir)
    }

    #[test]
    fn test_prepare_derives_socket_path() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), None);
        let storage = dir.path().join("data").join("code_analysis.db");
        let config = manager.prepare(DriverConfig::sqlite(&storage)).unwrap();
        assert_eq!(
            config.socket_path,
            Some(dir.path().join("data").join("code_analysis_driver.sock"))
        );
    }

    #[test]
    fn test_prepare_uses_socket_dir() {
        let dir = tempdir().unwrap();
        let sockets = dir.path().join("sockets");
        let manager = manager(dir.path(), Some(sockets.clone()));
        let config = manager
            .prepare(DriverConfig::sqlite(dir.path().join("code_analysis.db")))
            .unwrap();
        assert!(config.socket_path.unwrap().starts_with(&sockets));
    }

    #[test]
    fn test_prepare_rejects_bad_config() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), None);

        let mut config = DriverConfig::sqlite(dir.path().join("code_analysis.db"));
        config.driver_type = "mysql".to_string();
        assert!(matches!(
            manager.prepare(config),
            Err(SupervisorError::InvalidConfig { .. })
        ));

        let mut config = DriverConfig::sqlite(dir.path().join("code_analysis.db"));
        config.queue_capacity = 0;
        assert!(manager.prepare(config).is_err());
    }

    #[tokio::test]
    async fn test_stop_without_driver() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), None);
        let summary = manager.stop(Duration::from_secs(1)).await;
        assert_eq!(summary, StopSummary::default());
    }

    fn register_driver(manager: &DriverManager, socket: &Path) {
        manager.workers.registry().register(
            WorkerKind::DatabaseDriver,
            WorkerRecord::new(WorkerKind::DatabaseDriver, "database_driver", None)
                .with_socket_path(socket.to_path_buf()),
        );
    }

    #[tokio::test]
    async fn test_stop_removes_leftover_socket() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), None);
        let socket = dir.path().join("code_analysis_driver.sock");
        {
            // Dropping a std listener leaves the socket file behind
            let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        }
        register_driver(&manager, &socket);

        let summary = manager.stop(Duration::from_secs(1)).await;
        assert_eq!((summary.stopped, summary.failed), (1, 0));
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_stop_survives_unremovable_socket_path() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), None);
        // A directory where the socket should be: removal fails, stop carries on
        let socket = dir.path().join("code_analysis_driver.sock");
        std::fs::create_dir_all(socket.join("inner")).unwrap();
        register_driver(&manager, &socket);

        let summary = manager.stop(Duration::from_secs(1)).await;
        assert_eq!((summary.stopped, summary.failed), (1, 0));
        assert!(socket.is_dir());
        assert!(manager.workers.registry().is_empty());
    }
}
