//! The supervisor object: one per process, passed by reference to whatever
//! needs to start, stop or inspect workers.

use crate::driver_manager::DriverManager;
use crate::launcher::WorkerLauncher;
use crate::lifecycle::{LifecycleSettings, WorkerManager};
use crate::liveness::{ProcessProbe, SystemProbe};
use crate::monitor::WorkerMonitor;
use crate::registry::WorkerRegistry;
use crate::worker::{StopSummary, WorkerKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Supervisor {
    registry: Arc<WorkerRegistry>,
    workers: Arc<WorkerManager>,
    driver: DriverManager,
    monitor: WorkerMonitor,
}

impl Supervisor {
    pub fn new(
        settings: LifecycleSettings,
        socket_dir: Option<PathBuf>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self::with_probe(settings, socket_dir, launcher, Arc::new(SystemProbe::new()))
    }

    pub fn with_probe(
        settings: LifecycleSettings,
        socket_dir: Option<PathBuf>,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let workers = Arc::new(WorkerManager::new(
            registry.clone(),
            probe.clone(),
            launcher,
            settings,
        ));
        let driver = DriverManager::new(workers.clone(), socket_dir);
        let monitor = WorkerMonitor::new(registry.clone(), probe, workers.clone());
        Self {
            registry,
            workers,
            driver,
            monitor,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    pub fn driver(&self) -> &DriverManager {
        &self.driver
    }

    pub fn monitor(&self) -> &WorkerMonitor {
        &self.monitor
    }

    /// Stop the monitor, then every worker, the driver last so the others
    /// can still flush through it while they exit.
    pub async fn shutdown(&self, timeout: Duration) -> StopSummary {
        self.monitor.stop_monitoring(timeout).await;

        let mut summary = StopSummary::default();
        for kind in WorkerKind::ALL.iter().rev() {
            if *kind == WorkerKind::DatabaseDriver {
                continue;
            }
            summary.merge(self.workers.stop(*kind, timeout).await);
        }
        summary.merge(self.driver.stop(timeout).await);
        info!(
            "Supervisor shutdown: {} stopped, {} failed",
            summary.stopped, summary.failed
        );
        summary
    }
}
