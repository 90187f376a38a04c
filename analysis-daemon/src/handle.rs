use crate::error::HandleError;
use crate::liveness::{ProcessProbe, Signal, SignalOutcome};
use async_trait::async_trait;
use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;

/// A worker that can be asked to stop without signals (for example one that
/// runs in-process, or exposes a shutdown request).
#[async_trait]
pub trait StopHandle: Send + Sync {
    async fn stop(&self) -> anyhow::Result<()>;

    /// Whether the worker is still running, if the handle can tell.
    fn is_running(&self) -> Option<bool> {
        None
    }
}

/// Owned handle to a spawned child process.
///
/// Only the process that spawned the child may wait on or signal it through
/// the handle; every operation checks that first and reports
/// [`HandleError::NotOwned`] otherwise so callers can fall back to PID-based
/// control.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    owner: u32,
    child: Arc<Mutex<Option<Child>>>,
}

impl ProcessHandle {
    pub fn new(child: Child) -> Self {
        Self::with_owner(child, std::process::id())
    }

    /// Wrap a child whose handle was obtained by process `owner`.
    pub fn with_owner(child: Child, owner: u32) -> Self {
        Self {
            pid: child.id(),
            owner,
            child: Arc::new(Mutex::new(Some(child))),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn check_owner(&self) -> Result<(), HandleError> {
        let current = std::process::id();
        if self.owner != current {
            return Err(HandleError::NotOwned {
                pid: self.pid.unwrap_or_default(),
                owner: self.owner,
                current,
            });
        }
        Ok(())
    }

    /// `Ok(None)` while running, `Ok(Some(status))` once exited (and reaped).
    pub async fn try_wait(&self) -> Result<Option<ExitStatus>, HandleError> {
        self.check_owner()?;
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or(HandleError::Invalid { pid: self.pid })?;
        Ok(child.try_wait()?)
    }

    pub async fn is_running(&self) -> Result<bool, HandleError> {
        Ok(self.try_wait().await?.is_none())
    }

    /// Deliver `signal` to the child. A child that already exited yields
    /// [`SignalOutcome::NoSuchProcess`].
    pub async fn signal(
        &self,
        probe: &dyn ProcessProbe,
        signal: Signal,
    ) -> Result<SignalOutcome, HandleError> {
        self.check_owner()?;
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or(HandleError::Invalid { pid: self.pid })?;

        if child.try_wait()?.is_some() {
            return Ok(SignalOutcome::NoSuchProcess);
        }
        // tokio drops the id once the child has been reaped
        let pid = child.id().ok_or(HandleError::Invalid { pid: self.pid })?;
        Ok(probe.signal(pid, signal)?)
    }

    /// Wait up to `timeout` for the child to exit. Returns whether it did.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<bool, HandleError> {
        self.check_owner()?;
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or(HandleError::Invalid { pid: self.pid })?;

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(_status)) => Ok(true),
            Ok(Err(e)) => Err(HandleError::Io(e)),
            Err(_) => Ok(false),
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("owner", &self.owner)
            .finish()
    }
}

/// How the supervisor controls a registered worker.
#[derive(Clone)]
pub enum WorkerHandle {
    Process(ProcessHandle),
    Stoppable(Arc<dyn StopHandle>),
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerHandle::Process(handle) => handle.fmt(f),
            WorkerHandle::Stoppable(_) => f.write_str("Stoppable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::SystemProbe;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_handle_tracks_running_child() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let handle = ProcessHandle::new(child);
        assert!(handle.pid().is_some());
        assert!(handle.is_running().await.unwrap());

        let probe = SystemProbe::new();
        let outcome = handle.signal(&probe, Signal::Kill).await.unwrap();
        assert_eq!(outcome, SignalOutcome::Delivered);
        assert!(handle.wait_timeout(Duration::from_secs(2)).await.unwrap());
        assert!(!handle.is_running().await.unwrap());

        let outcome = handle.signal(&probe, Signal::Terminate).await.unwrap();
        assert_eq!(outcome, SignalOutcome::NoSuchProcess);
    }

    #[tokio::test]
    async fn test_foreign_handle_is_rejected() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let foreign_owner = std::process::id().wrapping_add(1);
        let handle = ProcessHandle::with_owner(child, foreign_owner);
        let probe = SystemProbe::new();

        match handle.try_wait().await {
            Err(HandleError::NotOwned { owner, .. }) => assert_eq!(owner, foreign_owner),
            other => panic!("expected NotOwned, got {other:?}"),
        }
        assert!(matches!(
            handle.signal(&probe, Signal::Terminate).await,
            Err(HandleError::NotOwned { .. })
        ));

        // PID-based control still works
        let pid = handle.pid().unwrap();
        assert_eq!(probe.signal(pid, Signal::Kill).unwrap(), SignalOutcome::Delivered);
    }
}
