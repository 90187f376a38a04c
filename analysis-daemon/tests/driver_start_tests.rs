use analysis_daemon::pid_file::PidFile;
use analysis_daemon::{
    DriverConfig, LifecycleSettings, ProcessProbe, Supervisor, SupervisorError, SystemProbe,
    WorkerConfig, WorkerKind, WorkerLauncher,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::process::Command;

/// Stands in for the driver entry point with a shell script.
struct ScriptLauncher(&'static str);

impl WorkerLauncher for ScriptLauncher {
    fn command(&self, _config: &WorkerConfig) -> Result<Command, SupervisorError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(self.0);
        Ok(cmd)
    }
}

fn supervisor(dir: &Path, script: &'static str) -> Supervisor {
    let mut settings = LifecycleSettings::new(dir.join("run"));
    settings.driver_ready_delay = Duration::from_millis(100);
    Supervisor::new(settings, None, Arc::new(ScriptLauncher(script)))
}

#[tokio::test]
async fn test_driver_exiting_during_start_is_a_failure() {
    let dir = tempdir().unwrap();
    let supervisor = supervisor(dir.path(), "exit 3");
    let config = DriverConfig::sqlite(dir.path().join("code_analysis.db"));

    let result = supervisor.driver().start(config).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.kind, WorkerKind::DatabaseDriver);
    assert_eq!(result.pid, None);
    assert!(
        result.message.contains("exited during startup"),
        "{}",
        result.message
    );

    assert!(supervisor.registry().get(WorkerKind::DatabaseDriver).is_empty());
    let pid_file = PidFile::new(dir.path().join("run").join("code_analysis_driver.pid"));
    assert_eq!(pid_file.read(), None);
}

#[tokio::test]
async fn test_driver_without_socket_yet_is_still_started() {
    let dir = tempdir().unwrap();
    let supervisor = supervisor(dir.path(), "sleep 30");
    let config = DriverConfig::sqlite(dir.path().join("code_analysis.db"));

    // A missing socket after the readiness wait is only a warning
    let result = supervisor.driver().start(config.clone()).await.unwrap();
    assert!(result.success, "{}", result.message);
    let pid = result.pid.unwrap();

    let records = supervisor.registry().get(WorkerKind::DatabaseDriver);
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].socket_path.as_deref(),
        Some(dir.path().join("code_analysis_driver.sock").as_path())
    );
    assert!(!supervisor.driver().is_responsive(&config).await);

    let summary = supervisor.driver().stop(Duration::from_secs(5)).await;
    assert_eq!((summary.stopped, summary.failed), (1, 0));
    assert!(!SystemProbe::new().is_alive(pid));
}

#[tokio::test]
async fn test_invalid_driver_config_is_raised() {
    let dir = tempdir().unwrap();
    let supervisor = supervisor(dir.path(), "sleep 30");
    let mut config = DriverConfig::sqlite(dir.path().join("code_analysis.db"));
    config.driver_type = "postgres".to_string();

    assert!(matches!(
        supervisor.driver().start(config).await,
        Err(SupervisorError::InvalidConfig { .. })
    ));
    assert!(supervisor.registry().is_empty());
}
