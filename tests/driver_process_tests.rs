use analysis_daemon::{
    DatabaseClient, DriverConfig, ExecutableLauncher, LifecycleSettings, ProcessProbe,
    Supervisor, SystemProbe, WorkerKind,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

/// Start the real driver entry point through the supervisor and talk to it.
#[tokio::test]
async fn test_supervised_driver_serves_and_stops() {
    let dir = tempdir().unwrap();
    let launcher = ExecutableLauncher::new(env!("CARGO_BIN_EXE_code-analysis"))
        .with_base_args(["--log-level".to_string(), "warn".to_string()]);
    let mut settings = LifecycleSettings::new(dir.path().join("run"));
    settings.driver_ready_delay = Duration::from_millis(200);
    let supervisor = Supervisor::new(settings, None, Arc::new(launcher));

    let storage = dir.path().join("data").join("code_analysis.db");
    let mut config = DriverConfig::sqlite(&storage);
    config.log_path = Some(dir.path().join("logs").join("database_driver.log"));
    let socket = dir.path().join("data").join("code_analysis_driver.sock");

    let result = supervisor.driver().start(config.clone()).await.unwrap();
    assert!(result.success, "{}", result.message);
    let pid = result.pid.unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !supervisor.driver().is_responsive(&config).await {
        assert!(Instant::now() < deadline, "driver never answered a ping");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(socket.exists());

    let mut client = DatabaseClient::for_storage(&storage, None).await.unwrap();
    client
        .execute("CREATE TABLE t (v INTEGER)", vec![])
        .await
        .unwrap();
    client
        .execute("INSERT INTO t (v) VALUES (?)", vec![json!(7)])
        .await
        .unwrap();
    let rows = client.execute("SELECT v FROM t", vec![]).await.unwrap();
    assert_eq!(rows[0]["v"], 7);
    client.disconnect();

    // One driver per socket
    let again = supervisor.driver().start(config.clone()).await.unwrap();
    assert!(!again.success);
    assert_eq!(again.pid, Some(pid));
    assert_eq!(
        supervisor.registry().get(WorkerKind::DatabaseDriver).len(),
        1
    );

    let summary = supervisor.driver().stop(Duration::from_secs(10)).await;
    assert_eq!((summary.stopped, summary.failed), (1, 0), "{:?}", summary.errors);
    assert!(!SystemProbe::new().is_alive(pid));
    assert!(!socket.exists());
    assert!(!supervisor.driver().is_responsive(&config).await);
}
