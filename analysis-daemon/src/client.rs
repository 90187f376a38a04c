//! Client side of the driver RPC.
//!
//! There is deliberately no way to open the storage file from here: a client
//! that cannot reach the driver fails.

use crate::error::ClientError;
use crate::ipc::IpcStream;
use crate::protocol::{BatchArgs, DriverRequest, DriverResponse, MessageCodec, Row, Statement};
use crate::socket_path::driver_socket_path;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// One connection to the database driver. Requests on a connection are
/// strictly sequential.
pub struct DatabaseClient {
    socket_path: PathBuf,
    stream: Option<IpcStream>,
    config: ClientConfig,
}

impl DatabaseClient {
    pub async fn connect(socket_path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        Self::connect_with(socket_path, ClientConfig::default()).await
    }

    pub async fn connect_with(
        socket_path: impl Into<PathBuf>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let mut client = Self {
            socket_path: socket_path.into(),
            stream: None,
            config,
        };
        client.reconnect().await?;
        Ok(client)
    }

    /// Connect to the driver that owns `storage_path`, locating its socket
    /// the same way the driver does.
    pub async fn for_storage(
        storage_path: &Path,
        socket_dir: Option<&Path>,
    ) -> Result<Self, ClientError> {
        Self::connect(driver_socket_path(storage_path, socket_dir)).await
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// (Re)open the connection, replacing any existing one.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        self.stream = None;
        let stream = IpcStream::connect_timeout(&self.socket_path, self.config.connect_timeout)
            .await
            .map_err(|e| ClientError::Unreachable {
                socket_path: self.socket_path.clone(),
                message: e.to_string(),
            })?;
        debug!("Connected to database driver at {:?}", self.socket_path);
        self.stream = Some(stream);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("Disconnected from {:?}", self.socket_path);
        }
    }

    pub async fn execute(&mut self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, ClientError> {
        self.request(DriverRequest::Execute {
            sql: sql.to_string(),
            params,
        })
        .await
    }

    /// Run all statements in one transaction on the driver.
    pub async fn execute_batch(
        &mut self,
        statements: Vec<Statement>,
    ) -> Result<Vec<Row>, ClientError> {
        self.request(DriverRequest::ExecuteBatch {
            args: BatchArgs { statements },
        })
        .await
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.request(DriverRequest::Ping).await.map(|_| ())
    }

    /// Queue depth, uptime and storage location reported by the driver.
    pub async fn status(&mut self) -> Result<Row, ClientError> {
        let rows = self.request(DriverRequest::Status).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ClientError::Protocol("empty status response".to_string()))
    }

    /// Ask the driver to drain its queue and exit.
    pub async fn shutdown_driver(&mut self) -> Result<(), ClientError> {
        self.request(DriverRequest::Shutdown).await?;
        self.disconnect();
        Ok(())
    }

    async fn request(&mut self, request: DriverRequest) -> Result<Vec<Row>, ClientError> {
        let response = self.send_request_internal(&request).await?;
        Ok(response.into_result()?)
    }

    async fn send_request_internal(
        &mut self,
        request: &DriverRequest,
    ) -> Result<DriverResponse, ClientError> {
        let request_timeout = self.config.request_timeout;
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        debug!("Sending {} request", request.operation());

        let exchange = async {
            MessageCodec::send(stream, request, request_timeout).await?;
            MessageCodec::read_framed(stream, request_timeout).await
        };

        let frame = match timeout(request_timeout, exchange).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                self.stream = None; // Clean up broken socket
                return Err(ClientError::Protocol(
                    "driver closed the connection".to_string(),
                ));
            }
            Ok(Err(e)) => {
                error!("Request to driver failed: {:#}", e);
                self.stream = None; // Clean up broken socket
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    e.to_string(),
                )));
            }
            Err(_) => {
                self.stream = None; // Clean up broken socket on timeout
                return Err(ClientError::Timeout(request_timeout));
            }
        };

        serde_json::from_slice(&frame).map_err(|e| {
            self.stream = None;
            ClientError::Protocol(format!("invalid response: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("missing_driver.sock");
        match DatabaseClient::connect(&socket).await {
            Err(ClientError::Unreachable { socket_path, .. }) => assert_eq!(socket_path, socket),
            Err(other) => panic!("expected Unreachable, got {other:?}"),
            Ok(_) => panic!("connected to a socket nobody listens on"),
        }
    }
}
