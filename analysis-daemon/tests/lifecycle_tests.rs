use analysis_daemon::handle::{ProcessHandle, WorkerHandle};
use analysis_daemon::liveness::wait_for_exit;
use analysis_daemon::pid_file::PidFile;
use analysis_daemon::{
    LifecycleSettings, PollingWorkerConfig, ProcessProbe, RestartSpec, Signal, SupervisorError, SystemProbe,
    WorkerConfig, WorkerKind, WorkerLauncher, WorkerManager, WorkerMonitor, WorkerRecord,
    WorkerRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::process::Command;

/// Runs a shell script in place of the real worker entry point.
struct ScriptLauncher(&'static str);

impl WorkerLauncher for ScriptLauncher {
    fn command(&self, _config: &WorkerConfig) -> Result<Command, SupervisorError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(self.0);
        Ok(cmd)
    }
}

fn indexing_config() -> WorkerConfig {
    WorkerConfig::Indexing(PollingWorkerConfig {
        socket_path: PathBuf::from("/tmp/code_analysis_driver.sock"),
        poll_interval_secs: 1,
        batch_size: 50,
        log_path: None,
    })
}

fn manager(pid_dir: &Path, script: &'static str) -> (Arc<WorkerManager>, Arc<WorkerRegistry>) {
    let registry = Arc::new(WorkerRegistry::new());
    let mut settings = LifecycleSettings::new(pid_dir);
    settings.kill_wait = Duration::from_secs(2);
    let manager = WorkerManager::new(
        registry.clone(),
        Arc::new(SystemProbe::new()),
        Arc::new(ScriptLauncher(script)),
        settings,
    );
    (Arc::new(manager), registry)
}

#[tokio::test]
async fn test_start_registers_exactly_one_record() {
    let dir = tempdir().unwrap();
    let (manager, registry) = manager(dir.path(), "sleep 30");

    let result = manager.start(indexing_config()).await;
    assert!(result.success, "start failed: {}", result.message);
    assert_eq!(result.kind, WorkerKind::Indexing);
    let pid = result.pid.expect("started worker has a PID");

    let records = registry.get(WorkerKind::Indexing);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].pid, Some(pid));
    assert!(records[0].restart.is_some());
    assert!(SystemProbe::new().is_alive(pid));

    let again = manager.start(indexing_config()).await;
    assert!(!again.success);
    assert_eq!(again.pid, Some(pid));
    assert_eq!(registry.get(WorkerKind::Indexing).len(), 1);

    let summary = manager
        .stop(WorkerKind::Indexing, Duration::from_secs(5))
        .await;
    assert_eq!((summary.stopped, summary.failed), (1, 0));
    assert!(!SystemProbe::new().is_alive(pid));
}

#[tokio::test]
async fn test_term_ignoring_worker_is_killed() {
    let dir = tempdir().unwrap();
    let (manager, registry) = manager(
        dir.path(),
        "trap '' TERM; while true; do sleep 0.1; done",
    );

    let result = manager.start(indexing_config()).await;
    assert!(result.success, "start failed: {}", result.message);
    let pid = result.pid.unwrap();
    // Let the shell install its trap
    tokio::time::sleep(Duration::from_millis(300)).await;

    let timeout = Duration::from_millis(500);
    let started = Instant::now();
    let summary = manager.stop(WorkerKind::Indexing, timeout).await;
    let elapsed = started.elapsed();

    assert_eq!(summary.stopped, 1, "errors: {:?}", summary.errors);
    assert_eq!(summary.failed, 0);
    assert!(
        elapsed < timeout + Duration::from_secs(2) + Duration::from_millis(500),
        "stop took {elapsed:?}"
    );
    assert!(!SystemProbe::new().is_alive(pid));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_stop_on_empty_registry() {
    let dir = tempdir().unwrap();
    let (manager, _) = manager(dir.path(), "sleep 30");
    for kind in WorkerKind::ALL {
        let summary = manager.stop(kind, Duration::from_secs(1)).await;
        assert_eq!((summary.stopped, summary.failed), (0, 0));
    }
}

// A reaped-later child shows up as a zombie; only Linux lets the probe see through that.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_foreign_handle_falls_back_to_pid() {
    let dir = tempdir().unwrap();
    let (manager, registry) = manager(dir.path(), "sleep 30");

    let child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id().unwrap();
    let foreign = ProcessHandle::with_owner(child, std::process::id().wrapping_add(1));
    registry.register(
        WorkerKind::Vectorization,
        WorkerRecord::new(WorkerKind::Vectorization, "vectorization", Some(pid))
            .with_handle(WorkerHandle::Process(foreign)),
    );

    let summary = manager
        .stop(WorkerKind::Vectorization, Duration::from_secs(5))
        .await;
    assert_eq!(summary.stopped, 1, "errors: {:?}", summary.errors);
    assert!(!SystemProbe::new().is_alive(pid));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_adopted_worker_can_be_stopped() {
    let dir = tempdir().unwrap();
    let (manager, registry) = manager(dir.path(), "sleep 30");

    // A worker left behind by an earlier supervisor
    let mut orphan = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = orphan.id();
    PidFile::new(dir.path().join("indexing.pid")).write(pid).unwrap();

    assert_eq!(manager.adopt(&indexing_config()).await, Some(pid));
    assert_eq!(registry.get(WorkerKind::Indexing).len(), 1);
    // Adopting twice doesn't duplicate the record
    assert_eq!(manager.adopt(&indexing_config()).await, Some(pid));
    assert_eq!(registry.get(WorkerKind::Indexing).len(), 1);

    let summary = manager
        .stop(WorkerKind::Indexing, Duration::from_secs(5))
        .await;
    assert_eq!(summary.stopped, 1, "errors: {:?}", summary.errors);
    assert!(!SystemProbe::new().is_alive(pid));
    assert_eq!(PidFile::new(dir.path().join("indexing.pid")).read(), None);
    let _ = orphan.wait();
}

#[tokio::test]
async fn test_monitor_restarts_killed_worker() {
    let dir = tempdir().unwrap();
    let (manager, registry) = manager(dir.path(), "sleep 30");
    let probe = Arc::new(SystemProbe::new());
    let monitor = WorkerMonitor::new(registry.clone(), probe.clone(), manager.clone());

    let first = manager.start(indexing_config()).await;
    let first_pid = first.pid.unwrap();
    probe.signal(first_pid, Signal::Kill).unwrap();

    // Give the kernel a moment to deliver the kill
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let record = registry.get(WorkerKind::Indexing).remove(0);
        if !record.is_alive(probe.as_ref()).await || Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let report = monitor.tick().await;
    assert_eq!(report.dead, 1);
    assert_eq!(report.restarted, 1);

    let records = registry.get(WorkerKind::Indexing);
    assert_eq!(records.len(), 1);
    let second_pid = records[0].pid.unwrap();
    assert_ne!(second_pid, first_pid);
    assert_eq!(records[0].restart, Some(RestartSpec::new(indexing_config())));

    manager
        .stop(WorkerKind::Indexing, Duration::from_secs(5))
        .await;
    assert!(wait_for_exit(probe.as_ref(), second_pid, Duration::from_secs(2)).await);
}

// The stopped orphan lingers as a zombie, which only Linux lets the probe see as dead
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_monitor_does_not_revive_explicitly_stopped_worker() {
    let dir = tempdir().unwrap();
    let (manager, registry) = manager(dir.path(), "sleep 30");
    let monitor = WorkerMonitor::new(
        registry.clone(),
        Arc::new(SystemProbe::new()),
        manager.clone(),
    );

    let mut orphan = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = orphan.id();
    PidFile::new(dir.path().join("indexing.pid")).write(pid).unwrap();
    assert_eq!(manager.adopt(&indexing_config()).await, Some(pid));

    assert!(monitor.start_monitoring(Duration::from_millis(2)));
    let summary = manager
        .stop(WorkerKind::Indexing, Duration::from_secs(5))
        .await;
    assert_eq!((summary.stopped, summary.failed), (1, 0));

    // Plenty of ticks for a queued restart to land
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(monitor.stop_monitoring(Duration::from_secs(2)).await);

    let leftover: Vec<_> = registry
        .get(WorkerKind::Indexing)
        .iter()
        .map(|r| r.pid)
        .collect();
    assert!(leftover.is_empty(), "stopped worker came back: {leftover:?}");
    assert_eq!(PidFile::new(dir.path().join("indexing.pid")).read(), None);

    manager.stop_all(Duration::from_secs(5)).await;
    let _ = orphan.wait();
}

#[tokio::test]
async fn test_concurrent_starts_spawn_one_worker() {
    let dir = tempdir().unwrap();
    let (manager, registry) = manager(dir.path(), "sleep 30");

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move { manager.start(indexing_config()).await }));
    }
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    let winners: Vec<_> = results.iter().filter(|r| r.success).collect();
    assert_eq!(winners.len(), 1);
    let pid = winners[0].pid;
    assert!(results.iter().all(|r| r.pid == pid));
    assert_eq!(registry.get(WorkerKind::Indexing).len(), 1);

    manager.stop_all(Duration::from_secs(5)).await;
}
