//! In-memory table of active workers, grouped by kind.
//!
//! The registry is shared between foreground lifecycle calls and the
//! background monitor. Every operation runs under one internal mutex; compound
//! "check then remove" sequences use [`WorkerRegistry::remove_record`], which
//! only removes the exact instance the caller inspected.

use crate::worker::{WorkerKind, WorkerRecord};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    entries: Mutex<BTreeMap<WorkerKind, Vec<WorkerRecord>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<WorkerKind, Vec<WorkerRecord>>> {
        // A panic while holding the lock leaves plain bookkeeping behind, still usable
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, kind: WorkerKind, record: WorkerRecord) {
        debug!("Registering {} worker {} (PID {:?})", kind, record.name, record.pid);
        self.entries().entry(kind).or_default().push(record);
    }

    /// Remove every record of `kind` with this PID. Returns how many went.
    pub fn unregister(&self, kind: WorkerKind, pid: u32) -> usize {
        let mut entries = self.entries();
        let Some(records) = entries.get_mut(&kind) else {
            return 0;
        };
        let before = records.len();
        records.retain(|r| r.pid != Some(pid));
        let removed = before - records.len();
        if records.is_empty() {
            entries.remove(&kind);
        }
        if removed > 0 {
            debug!("Unregistered {} {} worker(s) with PID {}", removed, kind, pid);
        }
        removed
    }

    fn same_instance(a: &WorkerRecord, b: &WorkerRecord) -> bool {
        a.pid == b.pid && a.name == b.name && a.created_at == b.created_at
    }

    /// Whether this exact record (same PID, name and creation time) is
    /// still registered.
    pub fn contains_record(&self, record: &WorkerRecord) -> bool {
        self.entries()
            .get(&record.kind)
            .is_some_and(|records| records.iter().any(|r| Self::same_instance(r, record)))
    }

    /// Remove this exact record (same PID, name and creation time) if it is
    /// still registered. A newer instance registered in the meantime is left
    /// alone.
    pub fn remove_record(&self, record: &WorkerRecord) -> bool {
        let mut entries = self.entries();
        let Some(records) = entries.get_mut(&record.kind) else {
            return false;
        };
        let position = records.iter().position(|r| Self::same_instance(r, record));
        let removed = match position {
            Some(idx) => {
                records.remove(idx);
                true
            }
            None => false,
        };
        if records.is_empty() {
            entries.remove(&record.kind);
        }
        removed
    }

    pub fn get(&self, kind: WorkerKind) -> Vec<WorkerRecord> {
        self.entries().get(&kind).cloned().unwrap_or_default()
    }

    /// Consistent snapshot of every kind's records.
    pub fn get_all(&self) -> BTreeMap<WorkerKind, Vec<WorkerRecord>> {
        self.entries().clone()
    }

    /// Drop all records of `kind`, returning them.
    pub fn clear(&self, kind: WorkerKind) -> Vec<WorkerRecord> {
        self.entries().remove(&kind).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
