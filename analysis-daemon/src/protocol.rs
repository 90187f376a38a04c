//! Wire format between database clients and the driver.
//!
//! Every message is a 4-byte big-endian length followed by that many bytes
//! of JSON. Requests carry an `operation` tag:
//!
//! ```json
//! {"operation": "execute", "sql": "SELECT 1", "params": []}
//! {"operation": "execute_batch", "args": {"statements": [{"sql": "...", "params": []}]}}
//! {"operation": "ping"}
//! ```
//!
//! Responses are `{"data": [row, ...]}` or `{"error": {"message", "code"}}`.

use crate::error::RpcError;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

/// Maximum message size: 10MB
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// One result row, keyed by column name in column order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchArgs {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DriverRequest {
    Execute {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    /// Run every statement in one transaction; all or nothing.
    ExecuteBatch { args: BatchArgs },
    Ping,
    Status,
    /// Stop accepting work, drain the queue and exit.
    Shutdown,
}

impl DriverRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            DriverRequest::Execute { .. } => "execute",
            DriverRequest::ExecuteBatch { .. } => "execute_batch",
            DriverRequest::Ping => "ping",
            DriverRequest::Status => "status",
            DriverRequest::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DriverResponse {
    Data { data: Vec<Row> },
    Error { error: RpcError },
}

impl DriverResponse {
    pub fn data(rows: Vec<Row>) -> Self {
        DriverResponse::Data { data: rows }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        DriverResponse::Error {
            error: RpcError::new(code, message),
        }
    }

    /// A single-row response built from a JSON object.
    pub fn single(value: Value) -> Self {
        match value {
            Value::Object(row) => DriverResponse::data(vec![row]),
            other => {
                let mut row = Row::new();
                row.insert("value".to_string(), other);
                DriverResponse::data(vec![row])
            }
        }
    }

    pub fn into_result(self) -> std::result::Result<Vec<Row>, RpcError> {
        match self {
            DriverResponse::Data { data } => Ok(data),
            DriverResponse::Error { error } => Err(error),
        }
    }
}

/// No frame started within the read timeout. The stream is still on a frame
/// boundary, so the caller may keep reading.
#[derive(Debug, thiserror::Error)]
#[error("no message arrived within {0:?}")]
pub struct IdleTimeout(pub Duration);

/// Length-prefixed JSON framing shared by client and driver.
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(msg)?;

        // Validate message size before encoding
        if json.len() > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                json.len(),
                MAX_MESSAGE_SIZE
            ));
        }

        let mut encoded = Vec::with_capacity(4 + json.len());
        encoded.extend_from_slice(&(json.len() as u32).to_be_bytes());
        encoded.extend_from_slice(&json);
        Ok(encoded)
    }

    /// Decode a complete frame (length prefix included).
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        if bytes.len() < 4 {
            return Err(anyhow::anyhow!("Message too short"));
        }

        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;

        // Validate message size to prevent excessive memory allocation
        if len > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                len,
                MAX_MESSAGE_SIZE
            ));
        }

        if bytes.len() < 4 + len {
            return Err(anyhow::anyhow!("Incomplete message"));
        }

        Ok(serde_json::from_slice(&bytes[4..4 + len])?)
    }

    /// Read one frame body. `Ok(None)` means the peer closed the connection
    /// cleanly before sending another frame.
    pub async fn read_framed<R>(reader: &mut R, read_timeout: Duration) -> Result<Option<Vec<u8>>>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut length_buf = [0u8; 4];
        // read_u8 is cancel safe: a timeout here consumes nothing
        match timeout(read_timeout, reader.read_u8()).await {
            Err(_) => return Err(IdleTimeout(read_timeout).into()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Ok(Err(e)) => return Err(anyhow::anyhow!("Failed to read message length: {}", e)),
            Ok(Ok(first)) => length_buf[0] = first,
        }
        // Once a frame has started the stream can't be resynchronized
        timeout(read_timeout, reader.read_exact(&mut length_buf[1..]))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout reading message length"))?
            .map_err(|e| anyhow::anyhow!("Failed to read message length: {}", e))?;

        let message_len = u32::from_be_bytes(length_buf) as usize;

        // Validate message size
        if message_len > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                message_len,
                MAX_MESSAGE_SIZE
            ));
        }

        // Read message body with timeout
        let mut message_buf = vec![0u8; message_len];
        timeout(read_timeout, reader.read_exact(&mut message_buf))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout reading message body"))?
            .map_err(|e| anyhow::anyhow!("Failed to read message body: {}", e))?;

        Ok(Some(message_buf))
    }

    /// Write `data` as one frame.
    pub async fn write_framed<W>(writer: &mut W, data: &[u8], write_timeout: Duration) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                data.len(),
                MAX_MESSAGE_SIZE
            ));
        }

        let length_bytes = (data.len() as u32).to_be_bytes();
        let mut frame = Vec::with_capacity(4 + data.len());
        frame.extend_from_slice(&length_bytes);
        frame.extend_from_slice(data);

        timeout(write_timeout, writer.write_all(&frame))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout writing message"))?
            .map_err(|e| anyhow::anyhow!("Failed to write message: {}", e))?;

        timeout(write_timeout, writer.flush())
            .await
            .map_err(|_| anyhow::anyhow!("Timeout flushing message"))?
            .map_err(|e| anyhow::anyhow!("Failed to flush message: {}", e))?;

        Ok(())
    }

    /// Serialize `msg` and write it as one frame.
    pub async fn send<W, T>(writer: &mut W, msg: &T, write_timeout: Duration) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
        T: Serialize,
    {
        let json = serde_json::to_vec(msg)?;
        Self::write_framed(writer, &json, write_timeout).await
    }
}
