//! File watcher worker: polls the watched directories for modification-time
//! changes and records each one in `file_changes` through the driver.

use super::{connect, is_connection_error, ShutdownSignal};
use analysis_daemon::lock_file::{LockInfo, Staleness};
use analysis_daemon::{FileWatcherConfig, Statement, SystemProbe};
use anyhow::Result;
use ignore::WalkBuilder;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Statements per `execute_batch` when flushing changes.
const FLUSH_CHUNK: usize = 500;

/// Files the server writes itself; recording them would feed back forever.
const IGNORED_EXTENSIONS: &[&str] = &[
    "db", "db-wal", "db-shm", "db-journal", "sock", "pid", "lock", "log",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub mtime: i64,
    pub size: u64,
}

pub type Snapshot = HashMap<PathBuf, FileState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub state: Option<FileState>,
}

fn is_ignored_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    IGNORED_EXTENSIONS
        .iter()
        .any(|ext| name.ends_with(&format!(".{ext}")))
}

/// Walk `dirs` (respecting .gitignore, skipping hidden entries) and record
/// every regular file's mtime and size.
pub fn scan(dirs: &[PathBuf]) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for dir in dirs {
        if !dir.exists() {
            debug!("Watched directory {:?} does not exist", dir);
            continue;
        }
        for entry in WalkBuilder::new(dir).build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) || is_ignored_file(entry.path()) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            snapshot.insert(
                entry.into_path(),
                FileState {
                    mtime,
                    size: metadata.len(),
                },
            );
        }
    }
    snapshot
}

/// Changes between two snapshots, ordered by path.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<FileChange> {
    let mut changes = Vec::new();
    for (path, state) in new {
        let kind = match old.get(path) {
            None => ChangeKind::Created,
            Some(previous) if previous != state => ChangeKind::Modified,
            Some(_) => continue,
        };
        changes.push(FileChange {
            path: path.clone(),
            kind,
            state: Some(*state),
        });
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Deleted,
                state: None,
            });
        }
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

fn insert_statement(change: &FileChange, detected_at: &str) -> Statement {
    let (mtime, size) = match change.state {
        Some(state) => (json!(state.mtime), json!(state.size)),
        None => (Value::Null, Value::Null),
    };
    Statement::new(
        "INSERT INTO file_changes (path, change_kind, mtime, size, detected_at) VALUES (?, ?, ?, ?, ?)",
        vec![
            json!(change.path.to_string_lossy()),
            json!(change.kind.as_str()),
            mtime,
            size,
            json!(detected_at),
        ],
    )
}

fn take_lock(config: &FileWatcherConfig) {
    if let Some(existing) = LockInfo::read(&config.lock_path) {
        if existing.pid != std::process::id()
            && existing.staleness(&SystemProbe::new()) == Staleness::Live
        {
            warn!(
                "Lock {:?} is held by live PID {} ({}), taking it over",
                config.lock_path, existing.pid, existing.worker_name
            );
        }
    }
    let info = LockInfo::for_current_process("file_watcher");
    if let Err(e) = info.write(&config.lock_path) {
        warn!("Failed to write lock file: {:#}", e);
    }
}

pub async fn run(config: FileWatcherConfig, shutdown: ShutdownSignal) -> Result<()> {
    info!(
        "File watcher started (PID {}), watching {:?}",
        std::process::id(),
        config.watch_dirs
    );
    take_lock(&config);

    let interval = Duration::from_secs(config.poll_interval_secs.max(1));
    let mut known = Snapshot::new();
    let mut pending: Vec<FileChange> = Vec::new();
    let mut client = None;

    while !shutdown.is_requested() {
        let dirs = config.watch_dirs.clone();
        let current = tokio::task::spawn_blocking(move || scan(&dirs)).await?;
        let changes = diff(&known, &current);
        if !changes.is_empty() {
            debug!("Detected {} file changes", changes.len());
        }
        pending.extend(changes);
        known = current;

        if !pending.is_empty() {
            if client.is_none() {
                client = connect(&config.socket_path, &shutdown).await;
            }
            let mut connection_lost = false;
            if let Some(active) = client.as_mut() {
                let detected_at = chrono::Utc::now().to_rfc3339();
                while !pending.is_empty() {
                    let take = pending.len().min(FLUSH_CHUNK);
                    let statements = pending[..take]
                        .iter()
                        .map(|c| insert_statement(c, &detected_at))
                        .collect();
                    match active.execute_batch(statements).await {
                        Ok(_) => {
                            pending.drain(..take);
                        }
                        Err(e) if is_connection_error(&e) => {
                            warn!("Lost driver connection, {} changes pending: {}", pending.len(), e);
                            connection_lost = true;
                            break;
                        }
                        Err(e) => {
                            // The driver rejected this chunk; retrying it won't help
                            warn!("Dropping {} changes the driver rejected: {}", take, e);
                            pending.drain(..take);
                        }
                    }
                }
            }
            if connection_lost {
                client = None;
            }
        }

        if shutdown.sleep(interval).await {
            break;
        }
    }

    match LockInfo::release(&config.lock_path) {
        Ok(true) => debug!("Released lock {:?}", config.lock_path),
        Ok(false) => {}
        Err(e) => warn!("Failed to remove lock file: {:#}", e),
    }
    info!("File watcher stopped");
    Ok(())
}
