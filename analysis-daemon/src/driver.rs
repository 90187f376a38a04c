//! The database driver: the one process that owns the storage file.
//!
//! Connections are served concurrently, but every storage request goes
//! through one bounded queue into one storage thread, so writes from all
//! clients are applied in FIFO arrival order.

use crate::error::{RpcError, SupervisorError};
use crate::ipc::{IpcListener, IpcStream};
use crate::protocol::{DriverRequest, DriverResponse, IdleTimeout, MessageCodec, Row, Statement};
use crate::storage::{open_backend, StorageBackend};
use crate::worker::DriverConfig;
use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const MAX_CONCURRENT_CONNECTIONS: u32 = 64;
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

enum StorageJob {
    Execute { sql: String, params: Vec<serde_json::Value> },
    Batch(Vec<Statement>),
}

struct QueuedJob {
    job: StorageJob,
    reply: oneshot::Sender<std::result::Result<Vec<Row>, RpcError>>,
}

/// Requests a running driver to shut down from inside the same process.
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<AtomicBool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct DriverState {
    queue: mpsc::Sender<QueuedJob>,
    queue_capacity: usize,
    enqueue_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    started: Instant,
    requests_served: AtomicU64,
    config: DriverConfig,
    socket_path: PathBuf,
}

impl DriverState {
    async fn handle(&self, request: DriverRequest) -> DriverResponse {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        match request {
            DriverRequest::Ping => DriverResponse::single(json!({ "pong": true })),
            DriverRequest::Status => DriverResponse::single(self.status()),
            DriverRequest::Shutdown => {
                info!("Shutdown requested by client");
                self.shutdown.store(true, Ordering::SeqCst);
                DriverResponse::single(json!({ "shutting_down": true }))
            }
            DriverRequest::Execute { sql, params } => {
                self.enqueue(StorageJob::Execute { sql, params }).await
            }
            DriverRequest::ExecuteBatch { args } => {
                self.enqueue(StorageJob::Batch(args.statements)).await
            }
        }
    }

    async fn enqueue(&self, job: StorageJob) -> DriverResponse {
        if self.shutdown.load(Ordering::SeqCst) {
            return DriverResponse::error(RpcError::SHUTTING_DOWN, "driver is shutting down");
        }

        let (reply, rx) = oneshot::channel();
        match timeout(self.enqueue_timeout, self.queue.send(QueuedJob { job, reply })).await {
            Err(_) => {
                warn!(
                    "Request queue full ({} pending), gave up after {:?}",
                    self.queue_capacity, self.enqueue_timeout
                );
                return DriverResponse::error(
                    RpcError::QUEUE_FULL,
                    format!("request queue is full ({} pending)", self.queue_capacity),
                );
            }
            Ok(Err(_)) => {
                return DriverResponse::error(RpcError::SHUTTING_DOWN, "storage thread has stopped");
            }
            Ok(Ok(())) => {}
        }

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(rows))) => DriverResponse::data(rows),
            Ok(Ok(Err(e))) => DriverResponse::Error { error: e },
            Ok(Err(_)) => {
                DriverResponse::error(RpcError::SHUTTING_DOWN, "storage thread dropped the request")
            }
            Err(_) => DriverResponse::error(
                RpcError::TIMEOUT,
                format!("request not completed within {REQUEST_TIMEOUT:?}"),
            ),
        }
    }

    fn status(&self) -> serde_json::Value {
        let free = self.queue.capacity();
        json!({
            "driver_type": self.config.driver_type,
            "storage_path": self.config.storage_path,
            "socket_path": self.socket_path,
            "pid": std::process::id(),
            "queue_capacity": self.queue_capacity,
            "pending": self.queue_capacity.saturating_sub(free),
            "requests_served": self.requests_served.load(Ordering::Relaxed),
            "uptime_secs": self.started.elapsed().as_secs(),
            "shutting_down": self.shutdown.load(Ordering::SeqCst),
        })
    }
}

pub struct DatabaseDriver {
    config: DriverConfig,
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle_signals: bool,
    enqueue_timeout: Duration,
}

impl DatabaseDriver {
    pub fn new(config: DriverConfig) -> std::result::Result<Self, SupervisorError> {
        if config.driver_type != "sqlite" {
            return Err(SupervisorError::invalid_config(format!(
                "unsupported driver_type {:?}, only \"sqlite\" is available",
                config.driver_type
            )));
        }
        if config.queue_capacity == 0 {
            return Err(SupervisorError::invalid_config(
                "queue_capacity must be at least 1",
            ));
        }
        let socket_path = config.effective_socket_path();
        Ok(Self {
            config,
            socket_path,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle_signals: true,
            enqueue_timeout: ENQUEUE_TIMEOUT,
        })
    }

    /// Leave SIGTERM/SIGINT alone; shutdown then comes only from a client
    /// request or a [`ShutdownTrigger`].
    pub fn without_signal_handling(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// How long a request may wait for room in a full queue before it is
    /// answered with `queue_full`.
    pub fn with_enqueue_timeout(mut self, enqueue_timeout: Duration) -> Self {
        self.enqueue_timeout = enqueue_timeout;
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(self.shutdown.clone())
    }

    /// Serve until shutdown, then drain the queue, close storage and remove
    /// the socket file.
    pub async fn run(self) -> Result<()> {
        let (queue, rx) = mpsc::channel(self.config.queue_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let storage_config = self.config.clone();
        let storage_thread = std::thread::Builder::new()
            .name("storage".to_string())
            .spawn(move || match open_backend(&storage_config) {
                Ok(backend) => {
                    let _ = ready_tx.send(Ok(()));
                    storage_loop(backend, rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .context("Failed to spawn storage thread")?;

        ready_rx
            .await
            .context("Storage thread exited before opening storage")?
            .with_context(|| {
                format!("Failed to open storage at {}", self.config.storage_path.display())
            })?;

        let listener = IpcListener::bind(&self.socket_path).await?;
        info!(
            "Database driver listening on {} (storage {}, queue capacity {})",
            self.socket_path.display(),
            self.config.storage_path.display(),
            self.config.queue_capacity
        );

        if self.handle_signals {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                    _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
                }
                shutdown.store(true, Ordering::SeqCst);
            });
        }

        let state = Arc::new(DriverState {
            queue,
            queue_capacity: self.config.queue_capacity,
            enqueue_timeout: self.enqueue_timeout,
            shutdown: self.shutdown.clone(),
            started: Instant::now(),
            requests_served: AtomicU64::new(0),
            config: self.config.clone(),
            socket_path: self.socket_path.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS as usize));

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Database driver shutting down...");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(stream) => match semaphore.clone().try_acquire_owned() {
                            Ok(permit) => {
                                let state = state.clone();
                                tokio::spawn(async move {
                                    let _permit = permit;
                                    if let Err(e) = handle_connection(stream, state).await {
                                        debug!("Connection closed with error: {:#}", e);
                                    }
                                });
                            }
                            Err(_) => {
                                warn!(
                                    "Connection limit reached ({} connections), rejecting new connection",
                                    MAX_CONCURRENT_CONNECTIONS
                                );
                                drop(stream);
                            }
                        },
                        Err(e) => error!("Error accepting connection: {}", e),
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        // Stop accepting and make the socket disappear before draining
        drop(listener);

        if timeout(
            DRAIN_TIMEOUT,
            semaphore.acquire_many(MAX_CONCURRENT_CONNECTIONS),
        )
        .await
        .is_err()
        {
            warn!("Connections still open after {:?}, closing storage anyway", DRAIN_TIMEOUT);
        }
        drop(state);

        match timeout(
            DRAIN_TIMEOUT,
            tokio::task::spawn_blocking(move || storage_thread.join()),
        )
        .await
        {
            Ok(Ok(Ok(()))) => info!("Storage closed, driver stopped"),
            Ok(_) => error!("Storage thread panicked"),
            Err(_) => warn!("Storage thread did not finish within {:?}", DRAIN_TIMEOUT),
        }
        Ok(())
    }
}

fn storage_loop(mut backend: Box<dyn StorageBackend>, mut rx: mpsc::Receiver<QueuedJob>) {
    // Runs until every sender is gone and the queue is empty
    while let Some(QueuedJob { job, reply }) = rx.blocking_recv() {
        let result = match job {
            StorageJob::Execute { sql, params } => backend.execute(&sql, &params),
            StorageJob::Batch(statements) => backend.execute_batch(&statements),
        };
        let result = result.map_err(|e| {
            debug!("Storage request failed: {}", e);
            RpcError::new(RpcError::STORAGE_ERROR, e.to_string())
        });
        if reply.send(result).is_err() {
            debug!("Requester went away before the reply was ready");
        }
    }

    let path = backend.path().to_path_buf();
    if let Err(e) = backend.close() {
        error!("Failed to close storage {}: {}", path.display(), e);
    }
}

async fn handle_connection(stream: IpcStream, state: Arc<DriverState>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut last_activity = Instant::now();

    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            debug!("Driver shutting down, closing client connection");
            break;
        }
        if last_activity.elapsed() > IDLE_TIMEOUT {
            debug!("Closing idle connection after {}s", IDLE_TIMEOUT.as_secs());
            break;
        }

        let frame = match MessageCodec::read_framed(&mut reader, READ_TIMEOUT).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Client disconnected");
                break;
            }
            Err(e) if e.is::<IdleTimeout>() => continue,
            Err(e) => return Err(e),
        };
        last_activity = Instant::now();

        let response = match serde_json::from_slice::<DriverRequest>(&frame) {
            Ok(request) => {
                debug!("Handling {} request", request.operation());
                state.handle(request).await
            }
            Err(e) => DriverResponse::error(RpcError::BAD_REQUEST, format!("invalid request: {e}")),
        };
        MessageCodec::send(&mut writer, &response, WRITE_TIMEOUT).await?;
    }
    Ok(())
}
