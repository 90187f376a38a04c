use analysis_daemon::ipc::IpcStream;
use analysis_daemon::protocol::MessageCodec;
use analysis_daemon::{
    driver_socket_path, ClientError, DatabaseClient, DatabaseDriver, DriverConfig,
    DriverResponse, RpcError, Statement,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use tokio::task::JoinHandle;

struct RunningDriver {
    _dir: TempDir,
    storage_path: PathBuf,
    socket_path: PathBuf,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn wait_for_socket(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if IpcStream::connect(path).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("driver never started listening on {}", path.display());
}

async fn start_driver(queue_capacity: usize) -> RunningDriver {
    start_driver_with(queue_capacity, Duration::from_secs(5), BTreeMap::new()).await
}

async fn start_driver_with(
    queue_capacity: usize,
    enqueue_timeout: Duration,
    driver_settings: BTreeMap<String, Value>,
) -> RunningDriver {
    let dir = tempdir().unwrap();
    let storage_path = dir.path().join("code_analysis.db");
    let mut config = DriverConfig::sqlite(&storage_path);
    config.queue_capacity = queue_capacity;
    config.driver_settings = driver_settings;

    let driver = DatabaseDriver::new(config)
        .unwrap()
        .without_signal_handling()
        .with_enqueue_timeout(enqueue_timeout);
    let socket_path = driver.socket_path().clone();
    let task = tokio::spawn(driver.run());
    wait_for_socket(&socket_path).await;

    RunningDriver {
        _dir: dir,
        storage_path,
        socket_path,
        task,
    }
}

async fn create_files_table(client: &mut DatabaseClient) {
    client
        .execute(
            "CREATE TABLE files (id INTEGER PRIMARY KEY, path TEXT NOT NULL UNIQUE, size INTEGER)",
            vec![],
        )
        .await
        .unwrap();
}

async fn stop_driver(driver: RunningDriver) {
    let mut client = DatabaseClient::connect(&driver.socket_path).await.unwrap();
    client.shutdown_driver().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(15), driver.task)
        .await
        .expect("driver did not stop")
        .unwrap();
    assert!(result.is_ok(), "driver failed: {result:?}");
    assert!(!driver.socket_path.exists());
}

#[tokio::test]
async fn test_writes_are_visible_to_other_clients_in_order() {
    let driver = start_driver(1000).await;
    let mut writer = DatabaseClient::connect(&driver.socket_path).await.unwrap();
    create_files_table(&mut writer).await;

    for i in 0..20 {
        let rows = writer
            .execute(
                "INSERT INTO files (path, size) VALUES (?, ?)",
                vec![json!(format!("src/file_{i}.rs")), json!(i * 10)],
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["rows_affected"], 1);
        assert_eq!(rows[0]["last_insert_rowid"], i + 1);
    }

    let mut reader = DatabaseClient::connect(&driver.socket_path).await.unwrap();
    let rows = reader
        .execute("SELECT id, path, size FROM files ORDER BY id", vec![])
        .await
        .unwrap();
    assert_eq!(rows.len(), 20);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row["path"], json!(format!("src/file_{i}.rs")));
        assert_eq!(row["size"], json!(i * 10));
        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        assert_eq!(columns, ["id", "path", "size"]);
    }

    stop_driver(driver).await;
}

#[tokio::test]
async fn test_concurrent_writers_all_land() {
    let driver = start_driver(16).await;
    let mut setup = DatabaseClient::connect(&driver.socket_path).await.unwrap();
    create_files_table(&mut setup).await;

    let mut tasks = Vec::new();
    for writer in 0..8 {
        let socket_path = driver.socket_path.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = DatabaseClient::connect(&socket_path).await.unwrap();
            for i in 0..25 {
                client
                    .execute(
                        "INSERT INTO files (path) VALUES (?)",
                        vec![json!(format!("w{writer}/f{i}"))],
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let rows = setup
        .execute("SELECT COUNT(*) AS n FROM files", vec![])
        .await
        .unwrap();
    assert_eq!(rows[0]["n"], 200);

    // Per-writer order is preserved
    let rows = setup
        .execute(
            "SELECT path FROM files WHERE path LIKE 'w3/%' ORDER BY id",
            vec![],
        )
        .await
        .unwrap();
    let paths: Vec<String> = rows
        .iter()
        .map(|r| r["path"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..25).map(|i| format!("w3/f{i}")).collect();
    assert_eq!(paths, expected);

    stop_driver(driver).await;
}

#[tokio::test]
async fn test_malformed_request_gets_bad_request() {
    let driver = start_driver(100).await;
    let mut stream = IpcStream::connect(&driver.socket_path).await.unwrap();

    MessageCodec::write_framed(
        &mut stream,
        br#"{"operation":"drop_everything"}"#,
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    let frame = MessageCodec::read_framed(&mut stream, Duration::from_secs(5))
        .await
        .unwrap()
        .expect("driver answered");
    let response: DriverResponse = serde_json::from_slice(&frame).unwrap();
    let error = response.into_result().unwrap_err();
    assert_eq!(error.code, RpcError::BAD_REQUEST);

    // Same connection still serves valid requests
    MessageCodec::send(
        &mut stream,
        &json!({ "operation": "ping" }),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    let frame = MessageCodec::read_framed(&mut stream, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    let response: DriverResponse = serde_json::from_slice(&frame).unwrap();
    assert!(response.into_result().is_ok());

    drop(stream);
    stop_driver(driver).await;
}

#[tokio::test]
async fn test_partial_length_prefix_drops_connection() {
    let driver = start_driver(10).await;
    let mut stream = IpcStream::connect(&driver.socket_path).await.unwrap();

    tokio::io::AsyncWriteExt::write_all(&mut stream, &[0, 0])
        .await
        .unwrap();
    // The driver gives up on the half-read frame instead of misreading what follows
    let closed = MessageCodec::read_framed(&mut stream, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(closed.is_none());

    drop(stream);
    stop_driver(driver).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_saturated_queue_answers_queue_full() {
    let mut settings = BTreeMap::new();
    settings.insert("busy_timeout".to_string(), json!(10_000));
    let driver = start_driver_with(1, Duration::from_millis(200), settings).await;
    let mut setup = DatabaseClient::connect(&driver.socket_path).await.unwrap();
    create_files_table(&mut setup).await;

    // An outside write lock parks the storage thread in its busy wait
    let blocker = rusqlite::Connection::open(&driver.storage_path).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let mut writers = Vec::new();
    for i in 0..4 {
        let socket = driver.socket_path.clone();
        writers.push(tokio::spawn(async move {
            let mut client = DatabaseClient::connect(&socket).await.unwrap();
            let result = client
                .execute(
                    "INSERT INTO files (path) VALUES (?)",
                    vec![json!(format!("q{i}.rs"))],
                )
                .await;
            (client, result)
        }));
    }

    // One job runs, one waits in the queue, the rest give up after 200ms
    tokio::time::sleep(Duration::from_secs(1)).await;
    blocker.execute_batch("COMMIT").unwrap();
    drop(blocker);

    let mut written = 0;
    let mut rejected = 0;
    for writer in writers {
        let (mut client, result) = writer.await.unwrap();
        match result {
            Ok(_) => written += 1,
            Err(ClientError::Remote { code, .. }) if code == RpcError::QUEUE_FULL => {
                rejected += 1;
                assert!(client.is_connected());
                client.ping().await.unwrap();
            }
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    assert!(rejected >= 1, "no request was rejected ({written} written)");
    assert_eq!(written + rejected, 4);

    let rows = setup
        .execute("SELECT COUNT(*) AS n FROM files", vec![])
        .await
        .unwrap();
    assert_eq!(rows[0]["n"], written);

    stop_driver(driver).await;
}

#[tokio::test]
async fn test_storage_error_keeps_connection_usable() {
    let driver = start_driver(100).await;
    let mut client = DatabaseClient::connect(&driver.socket_path).await.unwrap();

    match client.execute("SELECT * FROM no_such_table", vec![]).await {
        Err(ClientError::Remote { code, message }) => {
            assert_eq!(code, RpcError::STORAGE_ERROR);
            assert!(message.contains("no_such_table"), "{message}");
        }
        other => panic!("expected storage error, got {other:?}"),
    }

    assert!(client.is_connected());
    client.ping().await.unwrap();

    stop_driver(driver).await;
}

#[tokio::test]
async fn test_batch_is_all_or_nothing() {
    let driver = start_driver(100).await;
    let mut client = DatabaseClient::connect(&driver.socket_path).await.unwrap();
    create_files_table(&mut client).await;

    let failing = vec![
        Statement::new("INSERT INTO files (path) VALUES (?)", vec![json!("a.rs")]),
        Statement::new("INSERT INTO files (path) VALUES (?)", vec![json!("a.rs")]),
    ];
    let err = client.execute_batch(failing).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote { ref code, .. } if code == RpcError::STORAGE_ERROR));

    let rows = client
        .execute("SELECT COUNT(*) AS n FROM files", vec![])
        .await
        .unwrap();
    assert_eq!(rows[0]["n"], 0);

    let rows = client
        .execute_batch(vec![
            Statement::new("INSERT INTO files (path) VALUES (?)", vec![json!("a.rs")]),
            Statement::new("INSERT INTO files (path) VALUES (?)", vec![json!("b.rs")]),
        ])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["last_insert_rowid"], 2);

    stop_driver(driver).await;
}

#[tokio::test]
async fn test_status_reports_queue_and_storage() {
    let driver = start_driver(42).await;
    let mut client = DatabaseClient::connect(&driver.socket_path).await.unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status["driver_type"], "sqlite");
    assert_eq!(status["queue_capacity"], 42);
    assert_eq!(status["pending"], 0);
    assert_eq!(status["shutting_down"], false);
    assert_eq!(
        status["storage_path"],
        json!(driver.storage_path.to_string_lossy())
    );
    assert!(driver.storage_path.exists());

    stop_driver(driver).await;
}

#[tokio::test]
async fn test_client_finds_driver_from_storage_path() {
    let driver = start_driver(10).await;
    assert_eq!(
        driver_socket_path(&driver.storage_path, None),
        driver.socket_path
    );

    let mut client = DatabaseClient::for_storage(&driver.storage_path, None)
        .await
        .unwrap();
    client.ping().await.unwrap();

    stop_driver(driver).await;
}

#[tokio::test]
async fn test_requests_after_shutdown_are_refused() {
    let driver = start_driver(10).await;
    let mut idle = DatabaseClient::connect(&driver.socket_path).await.unwrap();
    let socket_path = driver.socket_path.clone();

    stop_driver(driver).await;

    // The idle connection was closed by the driver
    assert!(idle.ping().await.is_err());
    assert!(!idle.is_connected());
    assert!(matches!(
        DatabaseClient::connect(&socket_path).await,
        Err(ClientError::Unreachable { .. })
    ));
}
