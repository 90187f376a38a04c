// Analysis Daemon Library
// Worker supervision and the single-writer database driver

// Process control
pub mod handle;
pub mod launcher;
pub mod liveness;
pub mod lock_file;
pub mod pid_file;

// Worker bookkeeping and lifecycle
pub mod driver_manager;
pub mod lifecycle;
pub mod monitor;
pub mod registry;
pub mod supervisor;
pub mod worker;

// Database RPC
pub mod client;
pub mod driver;
pub mod ipc;
pub mod protocol;
pub mod socket_path;
pub mod storage;

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use client::{ClientConfig, DatabaseClient};
pub use driver::DatabaseDriver;
pub use driver_manager::DriverManager;
pub use error::{ClientError, HandleError, RpcError, StorageError, SupervisorError};
pub use launcher::{ExecutableLauncher, WorkerLauncher};
pub use lifecycle::{DeadWorker, LifecycleSettings, WorkerManager, WorkerStarter, WorkerStatus};
pub use liveness::{ProcessProbe, Signal, SignalOutcome, SystemProbe};
pub use monitor::{TickReport, WorkerMonitor};
pub use protocol::{DriverRequest, DriverResponse, MessageCodec, Row, Statement};
pub use registry::WorkerRegistry;
pub use socket_path::driver_socket_path;
pub use supervisor::Supervisor;
pub use worker::{
    DriverConfig, FileWatcherConfig, PollingWorkerConfig, RestartSpec, StopSummary,
    WorkerConfig, WorkerKind, WorkerRecord, WorkerStartResult,
};
