//! In-process runtime used for local runs and tests
//!
//! Instances become Ready after a configurable number of health probes.
//! Faults (transient call failures, latency, forced health) can be injected.

use super::{InstanceRuntime, RuntimeError};
use crate::model::{HealthSignal, InstancePhase, InstanceRequest, ReplicaInstance};
use crate::store::{ChangeType, EventBus, WatchEvent, WatchKind};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

struct SimInstance {
    instance: ReplicaInstance,
    probes: u32,
    forced: Option<HealthSignal>,
}

#[derive(Default)]
struct SimState {
    instances: BTreeMap<String, SimInstance>,
    revision_health: HashMap<String, HealthSignal>,
    latency: Duration,
}

pub struct SimulatedRuntime {
    state: Mutex<SimState>,
    /// NotReady probes before an instance reports Ready
    ready_after: u32,
    fail_next_calls: AtomicU32,
    creates: AtomicU64,
    deletes: AtomicU64,
    bus: Option<EventBus>,
}

impl SimulatedRuntime {
    /// Instances report Ready on their first probe
    pub fn new() -> Self {
        Self::with_ready_after(0)
    }

    pub fn with_ready_after(ready_after: u32) -> Self {
        SimulatedRuntime {
            state: Mutex::new(SimState::default()),
            ready_after,
            fail_next_calls: AtomicU32::new(0),
            creates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            bus: None,
        }
    }

    /// Publish instance add/update/delete notifications on `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn fail_next_calls(&self, n: u32) {
        self.fail_next_calls.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.latency = latency;
        }
    }

    /// Override the health reported for one instance
    pub fn set_health(&self, id: &str, signal: HealthSignal) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(sim) = state.instances.get_mut(id) {
                sim.forced = Some(signal);
            }
        }
    }

    /// Override the health reported for every instance of a revision
    pub fn set_revision_health(&self, revision: &str, signal: HealthSignal) {
        if let Ok(mut state) = self.state.lock() {
            state.revision_health.insert(revision.to_string(), signal);
        }
    }

    pub fn clear_revision_health(&self, revision: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.revision_health.remove(revision);
        }
    }

    /// Mark an instance as crashed
    pub fn mark_failed(&self, id: &str) {
        let workload = match self.state.lock() {
            Ok(mut state) => state.instances.get_mut(id).map(|sim| {
                sim.instance.phase = InstancePhase::Failed;
                sim.forced = Some(HealthSignal::NotReady);
                sim.instance.workload.clone()
            }),
            Err(_) => None,
        };
        if let Some(workload) = workload {
            self.publish(&workload, id, ChangeType::Modified);
        }
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().map(|s| s.instances.len()).unwrap_or(0)
    }

    /// Create and delete calls that changed something
    pub fn action_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst) + self.deletes.load(Ordering::SeqCst)
    }

    /// Live instance count per revision
    pub fn revision_counts(&self, workload: &str) -> BTreeMap<String, u32> {
        let mut counts = BTreeMap::new();
        if let Ok(state) = self.state.lock() {
            for sim in state.instances.values() {
                if sim.instance.workload == workload {
                    *counts.entry(sim.instance.revision.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Instances that would currently answer a probe with Ready
    pub fn ready_count(&self, workload: &str) -> u32 {
        self.state
            .lock()
            .map(|state| {
                state
                    .instances
                    .values()
                    .filter(|sim| {
                        sim.instance.workload == workload
                            && sim.instance.phase == InstancePhase::Ready
                            && Self::override_for(&state, sim).is_none()
                    })
                    .count() as u32
            })
            .unwrap_or(0)
    }

    fn override_for(state: &SimState, sim: &SimInstance) -> Option<HealthSignal> {
        sim.forced
            .or_else(|| state.revision_health.get(&sim.instance.revision).copied())
            .filter(|signal| *signal != HealthSignal::Ready)
    }

    fn publish(&self, workload: &str, id: &str, change: ChangeType) {
        if let Some(bus) = &self.bus {
            bus.publish(WatchEvent::new(WatchKind::Instance, workload, id, change));
        }
    }

    async fn enter(&self) -> Result<(), RuntimeError> {
        let latency = self.lock()?.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .fail_next_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(RuntimeError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|_| RuntimeError::Unavailable("simulator lock poisoned".to_string()))
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceRuntime for SimulatedRuntime {
    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, RuntimeError> {
        self.enter().await?;
        let created = {
            let mut state = self.lock()?;
            if state.instances.contains_key(&request.id) {
                false
            } else {
                state.instances.insert(
                    request.id.clone(),
                    SimInstance {
                        instance: ReplicaInstance {
                            id: request.id.clone(),
                            workload: request.workload.clone(),
                            revision: request.revision.clone(),
                            phase: InstancePhase::Pending,
                            created_at: Utc::now(),
                        },
                        probes: 0,
                        forced: None,
                    },
                );
                true
            }
        };
        if created {
            self.creates.fetch_add(1, Ordering::SeqCst);
            debug!(instance = %request.id, revision = %request.revision, "Simulated instance created");
            self.publish(&request.workload, &request.id, ChangeType::Added);
        }
        Ok(request.id.clone())
    }

    async fn delete_instance(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter().await?;
        let removed = self.lock()?.instances.remove(id);
        if let Some(sim) = removed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            debug!(instance = %id, "Simulated instance deleted");
            self.publish(&sim.instance.workload, id, ChangeType::Deleted);
        }
        Ok(())
    }

    async fn instance_health(&self, id: &str) -> Result<HealthSignal, RuntimeError> {
        self.enter().await?;
        let mut state = self.lock()?;
        let revision_health = state.revision_health.clone();
        let Some(sim) = state.instances.get_mut(id) else {
            return Ok(HealthSignal::Unknown);
        };
        if sim.instance.phase == InstancePhase::Failed {
            return Ok(HealthSignal::NotReady);
        }
        let forced = sim
            .forced
            .or_else(|| revision_health.get(&sim.instance.revision).copied());
        if let Some(signal) = forced {
            return Ok(signal);
        }
        sim.probes += 1;
        if sim.probes > self.ready_after {
            sim.instance.phase = InstancePhase::Ready;
            Ok(HealthSignal::Ready)
        } else {
            Ok(HealthSignal::NotReady)
        }
    }

    async fn list_instances(&self, workload: &str) -> Result<Vec<ReplicaInstance>, RuntimeError> {
        self.enter().await?;
        Ok(self
            .lock()?
            .instances
            .values()
            .filter(|sim| sim.instance.workload == workload)
            .map(|sim| sim.instance.clone())
            .collect())
    }
}
