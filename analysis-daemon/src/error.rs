use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Errors raised by supervisor operations for conditions callers can't
/// reasonably turn into a result value.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn {kind} worker: {message}")]
    Spawn { kind: String, message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database driver unreachable at {socket_path}: {message}")]
    DriverUnreachable { socket_path: PathBuf, message: String },
}

impl SupervisorError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Failures when querying or signalling a process through its owned handle.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    /// The handle was created by a different OS process.
    #[error("process handle for PID {pid} is owned by process {owner}, not {current}")]
    NotOwned { pid: u32, owner: u32, current: u32 },

    /// The handle no longer refers to a child we can wait on.
    #[error("process handle for PID {pid:?} is no longer valid")]
    Invalid { pid: Option<u32> },

    #[error("process handle I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire-level error carried in a driver response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub message: String,
    pub code: String,
}

impl RpcError {
    pub const BAD_REQUEST: &'static str = "bad_request";
    pub const STORAGE_ERROR: &'static str = "storage_error";
    pub const QUEUE_FULL: &'static str = "queue_full";
    pub const TIMEOUT: &'static str = "timeout";
    pub const SHUTTING_DOWN: &'static str = "shutting_down";

    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.to_string(),
        }
    }
}

/// Errors raised by the storage backend owned by the driver.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unsupported parameter value: {0}")]
    UnsupportedParam(String),

    #[error("Unsupported driver type: {0}")]
    UnsupportedDriver(String),

    #[error("Invalid driver setting {key}: {message}")]
    InvalidSetting { key: String, message: String },
}

/// Errors surfaced by the database client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Database driver unreachable at {socket_path}: {message}")]
    Unreachable { socket_path: PathBuf, message: String },

    #[error("Not connected to the database driver")]
    NotConnected,

    #[error("Driver returned an error ({code}): {message}")]
    Remote { code: String, message: String },

    #[error("Timed out after {0:?} waiting for the driver")]
    Timeout(std::time::Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error talking to the driver: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        ClientError::Remote {
            code: err.code,
            message: err.message,
        }
    }
}
