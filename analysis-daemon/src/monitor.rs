//! Background monitor that restarts workers which died on their own.

use crate::lifecycle::{DeadWorker, WorkerStarter};
use crate::liveness::ProcessProbe;
use crate::registry::WorkerRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause after a tick that blew up, before the loop carries on.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What one pass over the registry found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub dead: usize,
    pub restarted: usize,
    pub restart_failed: usize,
}

struct MonitorInner {
    registry: Arc<WorkerRegistry>,
    probe: Arc<dyn ProcessProbe>,
    starter: Arc<dyn WorkerStarter>,
    running: AtomicBool,
    wake: Notify,
    error_backoff: Duration,
}

impl MonitorInner {
    async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let snapshot = self.registry.get_all();

        for record in snapshot.into_values().flatten() {
            report.checked += 1;
            if record.is_alive(self.probe.as_ref()).await {
                continue;
            }

            // Rechecked under the starter's lock; an explicit stop or a fresh
            // start since the snapshot wins
            let outcome = self
                .starter
                .replace_dead(&self.registry, self.probe.as_ref(), &record)
                .await;
            if outcome == DeadWorker::Skipped {
                debug!("{} was stopped, replaced or recovered meanwhile", record.name);
                continue;
            }
            report.dead += 1;
            warn!(
                "Worker {} (PID {:?}) is no longer running",
                record.name, record.pid
            );
            let DeadWorker::Restarted(result) = outcome else {
                info!("No restart configuration for {}, leaving it stopped", record.name);
                continue;
            };
            if result.success {
                report.restarted += 1;
                info!(
                    "Restarted {} worker {} (PID {:?})",
                    record.kind, record.name, result.pid
                );
            } else {
                report.restart_failed += 1;
                error!(
                    "Failed to restart {} worker {}: {}",
                    record.kind, record.name, result.message
                );
            }
        }

        report
    }
}

pub struct WorkerMonitor {
    inner: Arc<MonitorInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        probe: Arc<dyn ProcessProbe>,
        starter: Arc<dyn WorkerStarter>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                registry,
                probe,
                starter,
                running: AtomicBool::new(false),
                wake: Notify::new(),
                error_backoff: ERROR_BACKOFF,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.error_backoff = backoff;
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run one pass now, independent of the background loop.
    pub async fn tick(&self) -> TickReport {
        self.inner.tick().await
    }

    /// Start the background loop. Returns false if it was already running.
    pub fn start_monitoring(&self, interval: Duration) -> bool {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Worker monitor already running");
            return false;
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            info!("Worker monitor started (interval {:?})", interval);
            while inner.running.load(Ordering::SeqCst) {
                // Separate task so a panicking tick can't take the loop down
                let tick_inner = inner.clone();
                match tokio::spawn(async move { tick_inner.tick().await }).await {
                    Ok(report) if report.dead > 0 => debug!("Monitor tick: {:?}", report),
                    Ok(_) => {}
                    Err(e) => {
                        error!("Monitor tick failed: {}", e);
                        tokio::select! {
                            _ = tokio::time::sleep(inner.error_backoff) => {}
                            _ = inner.wake.notified() => {}
                        }
                    }
                }

                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            info!("Worker monitor stopped");
        });

        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        true
    }

    /// Stop the loop after its current tick, waiting at most `timeout` for
    /// it to finish. Returns whether it finished in time.
    pub async fn stop_monitoring(&self, timeout: Duration) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return true;
        }
        self.inner.wake.notify_waiters();

        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(handle) = handle else {
            return true;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Worker monitor did not stop within {:?}, aborting it", timeout);
                abort.abort();
                false
            }
        }
    }
}

impl Drop for WorkerMonitor {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wake.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::{Signal, SignalOutcome};
    use crate::worker::{
        PollingWorkerConfig, RestartSpec, WorkerConfig, WorkerKind, WorkerRecord,
        WorkerStartResult,
    };
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;

    struct FakeProbe {
        alive: HashSet<u32>,
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.contains(&pid)
        }

        fn signal(&self, _pid: u32, _signal: Signal) -> std::io::Result<SignalOutcome> {
            Ok(SignalOutcome::NoSuchProcess)
        }
    }

    #[derive(Default)]
    struct RecordingStarter {
        calls: Mutex<Vec<WorkerConfig>>,
    }

    #[async_trait]
    impl WorkerStarter for RecordingStarter {
        async fn start_worker(&self, config: WorkerConfig) -> WorkerStartResult {
            let kind = config.kind();
            self.calls.lock().unwrap().push(config);
            WorkerStartResult::started(kind, 4242, "started")
        }
    }

    fn polling(poll_interval_secs: u64) -> WorkerConfig {
        WorkerConfig::Vectorization(PollingWorkerConfig {
            socket_path: PathBuf::from("/tmp/code_analysis_driver.sock"),
            poll_interval_secs,
            batch_size: 25,
            log_path: None,
        })
    }

    fn monitor(alive: &[u32]) -> (WorkerMonitor, Arc<WorkerRegistry>, Arc<RecordingStarter>) {
        let registry = Arc::new(WorkerRegistry::new());
        let starter = Arc::new(RecordingStarter::default());
        let monitor = WorkerMonitor::new(
            registry.clone(),
            Arc::new(FakeProbe {
                alive: alive.iter().copied().collect(),
            }),
            starter.clone(),
        );
        (monitor, registry, starter)
    }

    #[tokio::test]
    async fn test_tick_restarts_only_dead_worker() {
        let (monitor, registry, starter) = monitor(&[200]);
        let config = polling(7);
        registry.register(
            WorkerKind::Vectorization,
            WorkerRecord::new(WorkerKind::Vectorization, "vectorization", Some(100))
                .with_restart(RestartSpec::new(config.clone())),
        );
        registry.register(
            WorkerKind::Indexing,
            WorkerRecord::new(WorkerKind::Indexing, "indexing", Some(200)),
        );

        let report = monitor.tick().await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.dead, 1);
        assert_eq!(report.restarted, 1);

        assert!(registry.get(WorkerKind::Vectorization).is_empty());
        assert_eq!(registry.get(WorkerKind::Indexing).len(), 1);
        let calls = starter.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), [config]);
    }

    #[tokio::test]
    async fn test_dead_worker_without_restart_config_is_dropped() {
        let (monitor, registry, starter) = monitor(&[]);
        registry.register(
            WorkerKind::Indexing,
            WorkerRecord::new(WorkerKind::Indexing, "indexing", Some(300)),
        );

        let report = monitor.tick().await;
        assert_eq!(report.dead, 1);
        assert_eq!(report.restarted, 0);
        assert!(registry.is_empty());
        assert!(starter.calls.lock().unwrap().is_empty());

        // Nothing left to retry on the next pass
        assert_eq!(monitor.tick().await, TickReport::default());
    }

    #[tokio::test]
    async fn test_start_and_stop_monitoring() {
        let (monitor, registry, starter) = monitor(&[]);
        registry.register(
            WorkerKind::Vectorization,
            WorkerRecord::new(WorkerKind::Vectorization, "vectorization", Some(100))
                .with_restart(RestartSpec::new(polling(1))),
        );

        assert!(monitor.start_monitoring(Duration::from_millis(20)));
        assert!(!monitor.start_monitoring(Duration::from_millis(20)));
        assert!(monitor.is_running());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while starter.calls.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(monitor.stop_monitoring(Duration::from_secs(2)).await);
        assert!(!monitor.is_running());
        // The captured start ran once; the restarted instance is not registered by the fake
        assert_eq!(starter.calls.lock().unwrap().len(), 1);
        assert!(monitor.stop_monitoring(Duration::from_secs(1)).await);
    }
}
