//! Unix domain socket transport for the driver endpoint.

use crate::socket_path::{remove_socket_file, validate_socket_path};
use anyhow::{anyhow, Context as _, Result};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};

pub use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

pub struct IpcListener {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcListener {
    /// Bind `path`. An existing socket file is removed only when nobody is
    /// listening on it; a live listener makes the bind fail.
    pub async fn bind(path: &Path) -> Result<Self> {
        validate_socket_path(path)?;

        // Check if socket file exists and if a driver is listening
        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    return Err(anyhow!(
                        "Socket {} is already in use by another driver",
                        path.display()
                    ));
                }
                Err(_) => {
                    tracing::info!("Removing stale socket file: {}", path.display());
                    remove_socket_file(path)
                        .with_context(|| format!("Failed to remove stale socket {path:?}"))?;
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory {parent:?}"))?;
        }

        let listener = match UnixListener::bind(path) {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!("Socket bind failed due to address in use, retrying after delay");
                tokio::time::sleep(Duration::from_millis(100)).await;
                UnixListener::bind(path)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(anyhow!(
                    "Permission denied binding UNIX socket at {}. Set CODE_ANALYSIS_SOCKET_DIR to an allowed location.",
                    path.display()
                ));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<IpcStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcStream { stream })
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::trace!(
                "Failed to remove socket file during cleanup {}: {}",
                self.path.display(),
                e
            );
        } else {
            tracing::trace!("Cleaned up socket file: {}", self.path.display());
        }
    }
}

pub struct IpcStream {
    stream: UnixStream,
}

impl IpcStream {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self { stream })
    }

    /// Connect, giving up after `timeout`.
    pub async fn connect_timeout(path: &Path, timeout: Duration) -> Result<Self> {
        tokio::time::timeout(timeout, Self::connect(path))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", path.display()))?
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

impl AsyncRead for IpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Whether something accepts connections on `path` right now.
pub async fn is_listening(path: &Path, timeout: Duration) -> bool {
    IpcStream::connect_timeout(path, timeout).await.is_ok()
}
