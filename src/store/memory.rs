//! In-process state store with optional JSON snapshot persistence
//!
//! Used for local runs and tests. When constructed with a snapshot path,
//! `flush()` writes every table to disk and `open()` restores them, so
//! RolloutState and Revision records survive a restart.

use super::watch::{ChangeType, EventBus, WatchEvent, WatchKind};
use super::{StateStore, StoreError, Versioned};
use crate::model::{DesiredSpec, Revision, RolloutState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Default)]
struct Tables {
    #[serde(default)]
    specs: BTreeMap<String, Versioned<DesiredSpec>>,
    #[serde(default)]
    rollouts: BTreeMap<String, Versioned<RolloutState>>,
    #[serde(default)]
    revisions: BTreeMap<String, BTreeMap<String, Versioned<Revision>>>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    bus: EventBus,
    snapshot_path: Option<PathBuf>,
    unavailable: AtomicBool,
    fail_next_writes: AtomicU32,
    fail_next_spec_writes: AtomicU32,
    writes: AtomicU64,
}

/// Apply an optimistic-concurrency write to one table
///
/// Returns the new version and whether the key was newly created.
fn put_versioned<T>(
    table: &mut BTreeMap<String, Versioned<T>>,
    key: &str,
    value: T,
    expected: Option<u64>,
) -> Result<(u64, bool), StoreError> {
    let found = table.get(key).map(|v| v.version);
    let version = match (expected, found) {
        (None, None) => 1,
        (Some(e), Some(f)) if e == f => f + 1,
        _ => {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected,
                found,
            })
        }
    };
    table.insert(key.to_string(), Versioned { version, value });
    Ok((version, found.is_none()))
}

/// Consume one injected failure if any are left
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn change_type(created: bool) -> ChangeType {
    if created {
        ChangeType::Added
    } else {
        ChangeType::Modified
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_tables(Tables::default(), None)
    }

    fn with_tables(tables: Tables, snapshot_path: Option<PathBuf>) -> Self {
        MemoryStore {
            tables: Mutex::new(tables),
            bus: EventBus::new(),
            snapshot_path,
            unavailable: AtomicBool::new(false),
            fail_next_writes: AtomicU32::new(0),
            fail_next_spec_writes: AtomicU32::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Open a store backed by a snapshot file, restoring it if present
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                StoreError::Persistence(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => {
                return Err(StoreError::Persistence(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };
        info!(path = %path.display(), "Opened state snapshot");
        Ok(Self::with_tables(tables, Some(path)))
    }

    /// Event bus shared with collaborators that publish observed changes
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Make every call fail with `Unavailable` until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with `Unavailable`
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next_writes.store(n, Ordering::SeqCst);
    }

    /// Fail only the next `n` spec writes with `Unavailable`
    pub fn fail_next_spec_writes(&self, n: u32) {
        self.fail_next_spec_writes.store(n, Ordering::SeqCst);
    }

    /// Number of accepted writes (puts and deletes) so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    fn lock_for_write(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if take_one(&self.fail_next_writes) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        self.lock()
    }

    fn accepted(&self, event: WatchEvent) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.bus.publish(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_spec(&self, workload: &str) -> Result<Option<Versioned<DesiredSpec>>, StoreError> {
        Ok(self.lock()?.specs.get(workload).cloned())
    }

    async fn put_spec(&self, spec: DesiredSpec, expected: Option<u64>) -> Result<u64, StoreError> {
        let workload = spec.workload.clone();
        if take_one(&self.fail_next_spec_writes) {
            return Err(StoreError::Unavailable("injected spec write failure".to_string()));
        }
        let (version, created) = {
            let mut tables = self.lock_for_write()?;
            put_versioned(&mut tables.specs, &workload, spec, expected)?
        };
        self.accepted(WatchEvent::new(
            WatchKind::Spec,
            &workload,
            "",
            change_type(created),
        ));
        Ok(version)
    }

    async fn delete_spec(&self, workload: &str) -> Result<bool, StoreError> {
        let removed = self.lock_for_write()?.specs.remove(workload).is_some();
        if removed {
            self.accepted(WatchEvent::new(
                WatchKind::Spec,
                workload,
                "",
                ChangeType::Deleted,
            ));
        }
        Ok(removed)
    }

    async fn list_workloads(&self) -> Result<Vec<String>, StoreError> {
        let tables = self.lock()?;
        let names: BTreeSet<&String> = tables.specs.keys().chain(tables.rollouts.keys()).collect();
        Ok(names.into_iter().cloned().collect())
    }

    async fn get_rollout(
        &self,
        workload: &str,
    ) -> Result<Option<Versioned<RolloutState>>, StoreError> {
        Ok(self.lock()?.rollouts.get(workload).cloned())
    }

    async fn put_rollout(
        &self,
        state: RolloutState,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let workload = state.workload.clone();
        let (version, created) = {
            let mut tables = self.lock_for_write()?;
            put_versioned(&mut tables.rollouts, &workload, state, expected)?
        };
        self.accepted(WatchEvent::new(
            WatchKind::Rollout,
            &workload,
            "",
            change_type(created),
        ));
        Ok(version)
    }

    async fn delete_rollout(&self, workload: &str) -> Result<bool, StoreError> {
        let removed = self.lock_for_write()?.rollouts.remove(workload).is_some();
        if removed {
            self.accepted(WatchEvent::new(
                WatchKind::Rollout,
                workload,
                "",
                ChangeType::Deleted,
            ));
        }
        Ok(removed)
    }

    async fn list_revisions(&self, workload: &str) -> Result<Vec<Versioned<Revision>>, StoreError> {
        let tables = self.lock()?;
        let mut revisions: Vec<Versioned<Revision>> = tables
            .revisions
            .get(workload)
            .map(|revs| revs.values().cloned().collect())
            .unwrap_or_default();
        revisions.sort_by_key(|r| r.value.sequence);
        Ok(revisions)
    }

    async fn get_revision(
        &self,
        workload: &str,
        id: &str,
    ) -> Result<Option<Versioned<Revision>>, StoreError> {
        Ok(self
            .lock()?
            .revisions
            .get(workload)
            .and_then(|revs| revs.get(id))
            .cloned())
    }

    async fn put_revision(
        &self,
        revision: Revision,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let workload = revision.workload.clone();
        let id = revision.id.clone();
        let (version, created) = {
            let mut tables = self.lock_for_write()?;
            let table = tables.revisions.entry(workload.clone()).or_default();
            put_versioned(table, &id, revision, expected)?
        };
        self.accepted(WatchEvent::new(
            WatchKind::Revision,
            &workload,
            &id,
            change_type(created),
        ));
        Ok(version)
    }

    async fn delete_revision(&self, workload: &str, id: &str) -> Result<bool, StoreError> {
        let removed = {
            let mut tables = self.lock_for_write()?;
            let removed = tables
                .revisions
                .get_mut(workload)
                .map(|revs| revs.remove(id).is_some())
                .unwrap_or(false);
            if tables.revisions.get(workload).is_some_and(|r| r.is_empty()) {
                tables.revisions.remove(workload);
            }
            removed
        };
        if removed {
            self.accepted(WatchEvent::new(
                WatchKind::Revision,
                workload,
                id,
                ChangeType::Deleted,
            ));
        }
        Ok(removed)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let data = {
            let tables = self.lock()?;
            serde_json::to_vec_pretty(&*tables)
                .map_err(|e| StoreError::Persistence(e.to_string()))?
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| StoreError::Persistence(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Persistence(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), bytes = data.len(), "Flushed state snapshot");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
