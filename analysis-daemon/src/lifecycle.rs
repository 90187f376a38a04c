//! Worker lifecycle: start, stop and restart of worker processes.
//!
//! A start is guarded three ways: a per-kind async mutex inside this
//! supervisor, an exclusive file lock next to the PID file for other
//! supervisors on the same host, and the PID file itself for workers that
//! outlived the supervisor that started them.

use crate::error::HandleError;
use crate::handle::{ProcessHandle, WorkerHandle};
use crate::launcher::WorkerLauncher;
use crate::liveness::{wait_for_exit, ProcessProbe, Signal, SignalOutcome};
use crate::lock_file::{LockInfo, Staleness};
use crate::pid_file::{kind_pid_file_path, pid_file_path, PidFile, StartLock};
use crate::registry::WorkerRegistry;
use crate::socket_path::socket_exists;
use crate::worker::{
    RestartSpec, StopSummary, WorkerConfig, WorkerKind, WorkerRecord, WorkerStartResult,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What became of a record the monitor saw dead.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadWorker {
    /// Stopped, replaced or back up in the meantime; nothing was done.
    Skipped,
    /// Unregistered; it had no captured configuration to restart from.
    Removed,
    /// Unregistered and started again from its captured configuration.
    Restarted(WorkerStartResult),
}

/// Starts a worker from a captured configuration. The monitor restarts dead
/// workers through this seam.
#[async_trait]
pub trait WorkerStarter: Send + Sync {
    async fn start_worker(&self, config: WorkerConfig) -> WorkerStartResult;

    /// Unregister `record` if it is still registered and still dead, then
    /// start it again from its captured configuration.
    ///
    /// Implementors that also stop workers must run this exclusively with
    /// their stops, otherwise a worker dying under an explicit stop comes
    /// straight back.
    async fn replace_dead(
        &self,
        registry: &WorkerRegistry,
        probe: &dyn ProcessProbe,
        record: &WorkerRecord,
    ) -> DeadWorker {
        if record.is_alive(probe).await || !registry.remove_record(record) {
            return DeadWorker::Skipped;
        }
        match &record.restart {
            Some(spec) => DeadWorker::Restarted(self.start_worker(spec.config.clone()).await),
            None => DeadWorker::Removed,
        }
    }
}

/// Timing and location knobs for [`WorkerManager`].
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub pid_dir: PathBuf,
    /// How long to wait for exit after SIGKILL before giving up
    pub kill_wait: Duration,
    /// Pause before checking that a freshly started driver created its socket
    pub driver_ready_delay: Duration,
    /// How long a start waits for another supervisor's start lock
    pub start_lock_wait: Duration,
}

impl LifecycleSettings {
    pub fn new(pid_dir: impl Into<PathBuf>) -> Self {
        Self {
            pid_dir: pid_dir.into(),
            kill_wait: Duration::from_secs(2),
            driver_ready_delay: Duration::from_millis(500),
            start_lock_wait: Duration::from_secs(5),
        }
    }
}

/// Status of one registered worker instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub uptime_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

/// Everything the supervisor knows about one worker kind.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub kind: WorkerKind,
    pub instances: Vec<InstanceStatus>,
    pub pid_file: PathBuf,
    pub pid_file_pid: Option<u32>,
    pub pid_file_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_stale: Option<String>,
}

impl WorkerStatus {
    pub fn is_running(&self) -> bool {
        self.pid_file_alive || self.instances.iter().any(|i| i.alive)
    }
}

pub struct WorkerManager {
    registry: Arc<WorkerRegistry>,
    probe: Arc<dyn ProcessProbe>,
    launcher: Arc<dyn WorkerLauncher>,
    settings: LifecycleSettings,
    kind_locks: BTreeMap<WorkerKind, Mutex<()>>,
}

impl WorkerManager {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        probe: Arc<dyn ProcessProbe>,
        launcher: Arc<dyn WorkerLauncher>,
        settings: LifecycleSettings,
    ) -> Self {
        let kind_locks = WorkerKind::ALL
            .iter()
            .map(|kind| (*kind, Mutex::new(())))
            .collect();
        Self {
            registry,
            probe,
            launcher,
            settings,
            kind_locks,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn probe(&self) -> &Arc<dyn ProcessProbe> {
        &self.probe
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    fn kind_lock(&self, kind: WorkerKind) -> &Mutex<()> {
        // Built from WorkerKind::ALL, so every kind has an entry
        &self.kind_locks[&kind]
    }

    /// Start a worker for `config`.
    ///
    /// A worker that is already running is reported as `success = false`
    /// with its PID rather than started twice.
    pub async fn start(&self, config: WorkerConfig) -> WorkerStartResult {
        let kind = config.kind();
        let _guard = self.kind_lock(kind).lock().await;
        self.start_locked(config).await
    }

    async fn start_locked(&self, config: WorkerConfig) -> WorkerStartResult {
        let kind = config.kind();
        let name = config.worker_name();
        let pid_path = pid_file_path(&self.settings.pid_dir, &config);
        let pid_file = PidFile::new(&pid_path);

        let lock_target = pid_path.clone();
        let wait = self.settings.start_lock_wait;
        let start_lock =
            match tokio::task::spawn_blocking(move || StartLock::acquire(&lock_target, wait)).await
            {
                Ok(Ok(lock)) => lock,
                Ok(Err(e)) => {
                    warn!("Cannot start {}: {}", name, e);
                    return WorkerStartResult::failed(kind, None, e.to_string());
                }
                Err(e) => {
                    error!("Start lock task for {} failed: {}", name, e);
                    return WorkerStartResult::failed(
                        kind,
                        None,
                        format!("start lock task failed: {e}"),
                    );
                }
            };

        if let Some(pid) = pid_file.live_pid(self.probe.as_ref()) {
            info!("{} is already running (PID {})", name, pid);
            return WorkerStartResult::failed(
                kind,
                Some(pid),
                format!("{kind} worker already running (PID {pid})"),
            );
        }
        if let Some(pid) = self.registered_live_pid(kind).await {
            info!("{} is already registered and alive (PID {})", name, pid);
            return WorkerStartResult::failed(
                kind,
                Some(pid),
                format!("{kind} worker already running (PID {pid})"),
            );
        }

        let mut command = match self.launcher.command(&config) {
            Ok(command) => command,
            Err(e) => {
                error!("Failed to build command for {}: {}", name, e);
                return WorkerStartResult::failed(kind, None, e.to_string());
            }
        };
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn {}: {}", name, e);
                return WorkerStartResult::failed(kind, None, format!("failed to spawn: {e}"));
            }
        };
        let Some(pid) = child.id() else {
            error!("Spawned {} but it has no PID", name);
            return WorkerStartResult::failed(kind, None, "spawned process has no PID");
        };
        let handle = ProcessHandle::new(child);

        if let Err(e) = pid_file.write(pid) {
            // The registry still tracks the worker; only cross-supervisor detection suffers
            warn!("Failed to write PID file for {} (PID {}): {:#}", name, pid, e);
        }

        let mut record = WorkerRecord::new(kind, &name, Some(pid))
            .with_handle(WorkerHandle::Process(handle.clone()))
            .with_restart(RestartSpec::new(config.clone()));

        if let WorkerConfig::DatabaseDriver(driver) = &config {
            let socket = driver.effective_socket_path();
            self.wait_for_driver_socket(&socket, pid).await;
            if let Ok(Some(status)) = handle.try_wait().await {
                error!("Database driver (PID {}) exited during startup: {}", pid, status);
                let _ = pid_file.remove_if(pid);
                return WorkerStartResult::failed(
                    kind,
                    None,
                    format!("database driver exited during startup ({status})"),
                );
            }
            record = record.with_socket_path(socket);
        }

        self.registry.register(kind, record);
        drop(start_lock);

        info!("Started {} (PID {})", name, pid);
        WorkerStartResult::started(kind, pid, format!("{kind} worker started (PID {pid})"))
    }

    async fn registered_live_pid(&self, kind: WorkerKind) -> Option<u32> {
        for record in self.registry.get(kind) {
            if record.is_alive(self.probe.as_ref()).await {
                return record.pid;
            }
        }
        None
    }

    /// A missing socket is only a warning: the driver may still be opening
    /// its storage.
    async fn wait_for_driver_socket(&self, socket: &Path, pid: u32) {
        let delay = self.settings.driver_ready_delay;
        for _ in 0..2 {
            tokio::time::sleep(delay).await;
            if socket_exists(socket) {
                debug!("Driver (PID {}) is listening on {:?}", pid, socket);
                return;
            }
        }
        warn!(
            "Driver (PID {}) has not created {:?} yet; it may still be initializing",
            pid, socket
        );
    }

    /// Stop every registered instance of `kind`.
    ///
    /// Each instance gets SIGTERM, then SIGKILL once `timeout` passes. The
    /// kind is cleared from the registry whatever the per-instance outcome.
    pub async fn stop(&self, kind: WorkerKind, timeout: Duration) -> StopSummary {
        let _guard = self.kind_lock(kind).lock().await;
        self.stop_locked(kind, timeout).await
    }

    async fn stop_locked(&self, kind: WorkerKind, timeout: Duration) -> StopSummary {
        let records = self.registry.get(kind);
        let mut summary = StopSummary::default();
        if records.is_empty() {
            debug!("No {} workers registered", kind);
            return summary;
        }

        for record in &records {
            match self.stop_record(record, timeout).await {
                Ok(()) => {
                    summary.stopped += 1;
                    self.remove_pid_file(record);
                }
                Err(message) => {
                    summary.failed += 1;
                    summary.errors.push(message);
                }
            }
        }

        self.registry.clear(kind);
        info!(
            "Stopped {} {} worker(s), {} failed",
            summary.stopped, kind, summary.failed
        );
        summary
    }

    fn remove_pid_file(&self, record: &WorkerRecord) {
        let Some(pid) = record.pid else {
            return;
        };
        let path = match &record.restart {
            Some(spec) => pid_file_path(&self.settings.pid_dir, &spec.config),
            None => kind_pid_file_path(&self.settings.pid_dir, record.kind),
        };
        if let Err(e) = PidFile::new(path).remove_if(pid) {
            warn!("Failed to remove PID file for {}: {:#}", record.name, e);
        }
    }

    async fn stop_record(&self, record: &WorkerRecord, timeout: Duration) -> Result<(), String> {
        match &record.handle {
            Some(WorkerHandle::Stoppable(handle)) => handle
                .stop()
                .await
                .map_err(|e| format!("{}: stop failed: {e:#}", record.name)),
            Some(WorkerHandle::Process(handle)) => {
                match self.stop_via_handle(record, handle, timeout).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        debug!(
                            "Handle for {} unusable ({}), falling back to PID",
                            record.name, e
                        );
                        self.stop_via_pid(record, timeout).await
                    }
                }
            }
            None => self.stop_via_pid(record, timeout).await,
        }
    }

    async fn stop_via_handle(
        &self,
        record: &WorkerRecord,
        handle: &ProcessHandle,
        timeout: Duration,
    ) -> Result<Result<(), String>, HandleError> {
        let probe = self.probe.as_ref();
        if handle.signal(probe, Signal::Terminate).await? == SignalOutcome::NoSuchProcess {
            debug!("{} had already exited", record.name);
            return Ok(Ok(()));
        }
        if handle.wait_timeout(timeout).await? {
            info!("{} exited after SIGTERM", record.name);
            return Ok(Ok(()));
        }

        warn!(
            "{} did not exit within {:?}, sending SIGKILL",
            record.name, timeout
        );
        if handle.signal(probe, Signal::Kill).await? == SignalOutcome::NoSuchProcess {
            return Ok(Ok(()));
        }
        if handle.wait_timeout(self.settings.kill_wait).await? {
            return Ok(Ok(()));
        }
        Ok(Err(self.report_survivor(record)))
    }

    async fn stop_via_pid(&self, record: &WorkerRecord, timeout: Duration) -> Result<(), String> {
        let Some(pid) = record.pid else {
            debug!("{} has neither handle nor PID, nothing to signal", record.name);
            return Ok(());
        };
        let probe = self.probe.as_ref();

        match probe.signal(pid, Signal::Terminate) {
            Ok(SignalOutcome::NoSuchProcess) => return Ok(()),
            Ok(SignalOutcome::Delivered) => {}
            Err(e) => return Err(format!("{} (PID {pid}): SIGTERM failed: {e}", record.name)),
        }
        if wait_for_exit(probe, pid, timeout).await {
            info!("{} (PID {}) exited after SIGTERM", record.name, pid);
            return Ok(());
        }

        warn!(
            "{} (PID {}) did not exit within {:?}, sending SIGKILL",
            record.name, pid, timeout
        );
        match probe.signal(pid, Signal::Kill) {
            Ok(SignalOutcome::NoSuchProcess) => return Ok(()),
            Ok(SignalOutcome::Delivered) => {}
            Err(e) => return Err(format!("{} (PID {pid}): SIGKILL failed: {e}", record.name)),
        }
        if wait_for_exit(probe, pid, self.settings.kill_wait).await {
            return Ok(());
        }
        Err(self.report_survivor(record))
    }

    fn report_survivor(&self, record: &WorkerRecord) -> String {
        error!(
            critical = true,
            "CRITICAL: {} (PID {:?}) survived SIGKILL",
            record.name,
            record.pid
        );
        format!("{} (PID {:?}) survived SIGKILL", record.name, record.pid)
    }

    /// Stop every instance of the config's kind, then start it again.
    pub async fn restart(&self, config: WorkerConfig, timeout: Duration) -> WorkerStartResult {
        let kind = config.kind();
        let _guard = self.kind_lock(kind).lock().await;
        let summary = self.stop_locked(kind, timeout).await;
        if !summary.is_clean() {
            warn!(
                "Restarting {} after an unclean stop: {}",
                kind,
                summary.errors.join("; ")
            );
        }
        self.start_locked(config).await
    }

    /// Restart `kind` with the configuration captured at its last start.
    pub async fn restart_kind(&self, kind: WorkerKind, timeout: Duration) -> WorkerStartResult {
        let captured = self
            .registry
            .get(kind)
            .into_iter()
            .find_map(|record| record.restart);
        match captured {
            Some(spec) => self.restart(spec.config, timeout).await,
            None => WorkerStartResult::failed(
                kind,
                None,
                format!("no captured configuration for {kind}"),
            ),
        }
    }

    /// Start `configs` in order, stopping at nothing: each result is returned.
    pub async fn start_all(&self, configs: Vec<WorkerConfig>) -> Vec<WorkerStartResult> {
        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            results.push(self.start(config).await);
        }
        results
    }

    /// Stop every kind, the driver last.
    pub async fn stop_all(&self, timeout: Duration) -> StopSummary {
        let mut total = StopSummary::default();
        for kind in WorkerKind::ALL.iter().rev() {
            total.merge(self.stop(*kind, timeout).await);
        }
        total
    }

    /// Register a worker left running by an earlier supervisor, found through
    /// its PID file. Returns the adopted PID.
    pub async fn adopt(&self, config: &WorkerConfig) -> Option<u32> {
        let kind = config.kind();
        let _guard = self.kind_lock(kind).lock().await;

        let pid_file = PidFile::new(pid_file_path(&self.settings.pid_dir, config));
        let pid = pid_file.live_pid(self.probe.as_ref())?;
        if self.registry.get(kind).iter().any(|r| r.pid == Some(pid)) {
            return Some(pid);
        }

        let mut record = WorkerRecord::new(kind, config.worker_name(), Some(pid))
            .with_restart(RestartSpec::new(config.clone()));
        if let WorkerConfig::DatabaseDriver(driver) = config {
            record = record.with_socket_path(driver.effective_socket_path());
        }
        debug!("Adopting {} (PID {}) from {:?}", kind, pid, pid_file.path());
        self.registry.register(kind, record);
        Some(pid)
    }

    /// Status of the worker described by `config`.
    pub async fn status(&self, config: &WorkerConfig) -> WorkerStatus {
        let kind = config.kind();
        let mut instances = Vec::new();
        for record in self.registry.get(kind) {
            instances.push(InstanceStatus {
                alive: record.is_alive(self.probe.as_ref()).await,
                uptime_secs: record.uptime().num_seconds(),
                name: record.name,
                pid: record.pid,
                socket_path: record.socket_path,
            });
        }

        let pid_path = pid_file_path(&self.settings.pid_dir, config);
        let pid_file = PidFile::new(&pid_path);
        let pid_file_pid = pid_file.read();
        let pid_file_alive = pid_file.live_pid(self.probe.as_ref()).is_some();

        let (lock, lock_stale) = match config {
            WorkerConfig::FileWatcher(watcher) => match LockInfo::read(&watcher.lock_path) {
                Some(info) => {
                    let stale = match info.staleness(self.probe.as_ref()) {
                        Staleness::Live => None,
                        Staleness::DeadProcess => Some("process is gone".to_string()),
                        Staleness::ForeignHost(host) => Some(format!("written on host {host}")),
                    };
                    (Some(info), stale)
                }
                None => (None, None),
            },
            _ => (None, None),
        };

        WorkerStatus {
            kind,
            instances,
            pid_file: pid_path,
            pid_file_pid,
            pid_file_alive,
            lock,
            lock_stale,
        }
    }
}

#[async_trait]
impl WorkerStarter for WorkerManager {
    async fn start_worker(&self, config: WorkerConfig) -> WorkerStartResult {
        self.start(config).await
    }

    async fn replace_dead(
        &self,
        registry: &WorkerRegistry,
        probe: &dyn ProcessProbe,
        record: &WorkerRecord,
    ) -> DeadWorker {
        // Held across check, removal and start so a concurrent stop wins
        let _guard = self.kind_lock(record.kind).lock().await;
        if !registry.contains_record(record) || record.is_alive(probe).await {
            return DeadWorker::Skipped;
        }
        registry.remove_record(record);
        match &record.restart {
            Some(spec) => DeadWorker::Restarted(self.start_locked(spec.config.clone()).await),
            None => DeadWorker::Removed,
        }
    }
}
