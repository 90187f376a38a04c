//! PID files recording which process believes it owns a worker slot.
//!
//! A PID file is advisory. Its presence never implies liveness: callers pair
//! every read with a [`ProcessProbe`] check via [`PidFile::live_pid`].

use crate::liveness::ProcessProbe;
use crate::worker::{WorkerConfig, WorkerKind};
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Slack between a process's reported start time and the PID file write.
/// Start times come from clock ticks since boot and can be off by a little.
const START_TIME_TOLERANCE: Duration = Duration::from_secs(2);

/// PID file location for a worker: `<pid_dir>/<kind>.pid`, or
/// `<pid_dir>/<storage-stem>_driver.pid` for the database driver.
pub fn pid_file_path(pid_dir: &Path, config: &WorkerConfig) -> PathBuf {
    match config {
        WorkerConfig::DatabaseDriver(driver) => {
            pid_dir.join(format!("{}_driver.pid", driver.storage_stem()))
        }
        other => kind_pid_file_path(pid_dir, other.kind()),
    }
}

pub fn kind_pid_file_path(pid_dir: &Path, kind: WorkerKind) -> PathBuf {
    pid_dir.join(format!("{kind}.pid"))
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded PID. Missing, unreadable or non-integer content all mean
    /// "no PID known".
    pub fn read(&self) -> Option<u32> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                debug!("Ignoring unreadable PID file {:?}: {}", self.path, e);
                return None;
            }
        };

        match contents.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Some(pid),
            _ => {
                debug!(
                    "Ignoring PID file {:?} with invalid contents {:?}",
                    self.path,
                    contents.trim()
                );
                None
            }
        }
    }

    /// The recorded PID if that process is alive and is plausibly the one
    /// that wrote the file. A PID that was recycled by a process started
    /// after the file was written counts as stale.
    pub fn live_pid(&self, probe: &dyn ProcessProbe) -> Option<u32> {
        let pid = self.read()?;
        if !probe.is_alive(pid) {
            debug!("PID file {:?} names dead process {}", self.path, pid);
            return None;
        }

        let written = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if let (Some(written), Some(started)) = (written, probe.start_time(pid)) {
            if started > written + START_TIME_TOLERANCE {
                warn!(
                    "PID {} from {:?} was reused by a newer process; treating PID file as stale",
                    pid, self.path
                );
                return None;
            }
        }

        Some(pid)
    }

    /// Write `pid`, replacing any previous content atomically.
    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create PID directory {parent:?}"))?;
        }

        let tmp = self.path.with_extension("pid.tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("Failed to create temporary PID file {tmp:?}"))?;
            write!(file, "{pid}").context("Failed to write PID")?;
            file.flush().context("Failed to flush PID file")?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move PID file into place at {:?}", self.path))?;
        Ok(())
    }

    /// Remove the file only if it still names `pid`.
    pub fn remove_if(&self, pid: u32) -> Result<bool> {
        match self.read() {
            Some(recorded) if recorded == pid => {
                fs::remove_file(&self.path)
                    .with_context(|| format!("Failed to remove PID file {:?}", self.path))?;
                Ok(true)
            }
            Some(recorded) => {
                debug!(
                    "PID file {:?} now names {} (not {}), leaving it",
                    self.path, recorded, pid
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove PID file {:?}", self.path)),
        }
    }
}

/// Exclusive advisory lock serializing concurrent starts of the same worker
/// slot on this host. Released on drop.
#[derive(Debug)]
pub struct StartLock {
    file: File,
    path: PathBuf,
}

impl StartLock {
    pub fn path_for(pid_file: &Path) -> PathBuf {
        let mut name = pid_file.as_os_str().to_owned();
        name.push(".start.lock");
        PathBuf::from(name)
    }

    /// Try to take the lock, polling until `wait` elapses.
    pub fn acquire(pid_file: &Path, wait: Duration) -> Result<Self> {
        let path = Self::path_for(pid_file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open start lock {path:?}"))?;

        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired start lock {:?}", path);
                    return Ok(Self { file, path });
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(_) => {
                    return Err(anyhow!(
                        "Another start is already in progress (lock {:?} held)",
                        path
                    ));
                }
            }
        }
    }
}

impl Drop for StartLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release start lock {:?}: {}", self.path, e);
        }
    }
}
