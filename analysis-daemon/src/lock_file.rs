//! Diagnostic lock file written by the file watcher.
//!
//! Unlike the PID file this carries instance identity (host, creation time)
//! for status output and stale-instance reports. The start/stop path never
//! consults it.

use crate::liveness::ProcessProbe;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub worker_name: String,
    pub hostname: String,
}

/// Why a lock file no longer describes a running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Live,
    DeadProcess,
    ForeignHost(String),
}

impl LockInfo {
    /// Lock info describing the calling process.
    pub fn for_current_process(worker_name: impl Into<String>) -> Self {
        Self {
            pid: std::process::id(),
            created_at: Utc::now(),
            worker_name: worker_name.into(),
            hostname: hostname(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {parent:?}"))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write lock file {path:?}"))?;
        Ok(())
    }

    /// Read a lock file. A missing or unparsable file yields `None`.
    pub fn read(path: &Path) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("Ignoring malformed lock file {:?}: {}", path, e);
                None
            }
        }
    }

    /// Remove the lock file at `path` if it belongs to the calling process.
    pub fn release(path: &Path) -> Result<bool> {
        match Self::read(path) {
            Some(info) if info.pid == std::process::id() => {
                fs::remove_file(path)
                    .with_context(|| format!("Failed to remove lock file {path:?}"))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn staleness(&self, probe: &dyn ProcessProbe) -> Staleness {
        let local = hostname();
        if !self.hostname.is_empty() && self.hostname != local {
            return Staleness::ForeignHost(self.hostname.clone());
        }
        if probe.is_alive(self.pid) {
            Staleness::Live
        } else {
            Staleness::DeadProcess
        }
    }
}

/// Host name of this machine, empty if it can't be determined.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return std::env::var("HOSTNAME").unwrap_or_default();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
