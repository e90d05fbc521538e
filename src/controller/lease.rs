//! Per-workload leases
//!
//! Every mutation of a workload's RolloutState happens while holding that
//! workload's lease. The reconcile worker and the canary timer both take it,
//! so the two never interleave on the same record.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct LeaseTable {
    leases: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one reconcile or canary evaluation
pub struct Lease {
    workload: String,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    pub fn workload(&self) -> &str {
        &self.workload
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the workload's lease is free and take it
    pub async fn acquire(&self, workload: &str) -> Lease {
        let lock = self.slot(workload);
        Lease {
            workload: workload.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Take the lease only if nobody holds it
    pub fn try_acquire(&self, workload: &str) -> Option<Lease> {
        let lock = self.slot(workload);
        lock.try_lock_owned().ok().map(|guard| Lease {
            workload: workload.to_string(),
            _guard: guard,
        })
    }

    /// Drop the slot of a deleted workload if it is idle
    pub fn forget(&self, workload: &str) {
        self.leases
            .remove_if(workload, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn slot(&self, workload: &str) -> Arc<Mutex<()>> {
        self.leases
            .entry(workload.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
