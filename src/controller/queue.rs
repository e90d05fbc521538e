//! Bounded, coalescing, delay-aware work queue
//!
//! Keys are ordered by the instant they become eligible (a min-heap). Adding a
//! key that is already queued keeps the earlier of the two instants. A key
//! handed to a worker is not handed out again until `done()` is called; adds
//! that arrive meanwhile are parked and rescheduled on `done()`, so one key is
//! never processed by two workers at once.

use super::reconcile::ObjectRef;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue full ({0} keys pending)")]
    Full(usize),

    #[error("work queue shutting down")]
    ShuttingDown,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<(Instant, u64, ObjectRef)>>,
    /// Live heap entry per key; anything else in the heap is stale
    pending: HashMap<ObjectRef, (Instant, u64)>,
    processing: HashSet<ObjectRef>,
    /// Re-adds received while the key was being processed
    dirty: HashMap<ObjectRef, Instant>,
    seq: u64,
    shutdown: bool,
}

impl QueueState {
    fn schedule(&mut self, key: ObjectRef, at: Instant) {
        self.seq += 1;
        self.pending.insert(key.clone(), (at, self.seq));
        self.heap.push(Reverse((at, self.seq, key)));
    }
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        WorkQueue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Poisoning is ignored: no operation leaves the state half-updated
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: ObjectRef) -> Result<(), QueueError> {
        self.add_after(key, Duration::ZERO)
    }

    /// Schedule `key` to become eligible after `delay`
    pub fn add_after(&self, key: ObjectRef, delay: Duration) -> Result<(), QueueError> {
        let at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutdown {
                return Err(QueueError::ShuttingDown);
            }
            if state.processing.contains(&key) {
                let parked = state.dirty.entry(key).or_insert(at);
                *parked = (*parked).min(at);
                return Ok(());
            }
            match state.pending.get(&key) {
                Some((existing, _)) if *existing <= at => return Ok(()),
                Some(_) => {}
                None if state.pending.len() >= self.capacity => {
                    return Err(QueueError::Full(state.pending.len()));
                }
                None => {}
            }
            state.schedule(key, at);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next eligible key; `None` once the queue is shut down
    pub async fn pop(&self) -> Option<ObjectRef> {
        loop {
            // Created before inspecting state so a concurrent shutdown is not missed
            let notified = self.notify.notified();
            let next_at = {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                let now = Instant::now();
                let mut next_at = None;
                while let Some(Reverse((at, seq, key))) = state.heap.peek().cloned() {
                    if state.pending.get(&key) != Some(&(at, seq)) {
                        state.heap.pop();
                        continue;
                    }
                    if at <= now {
                        state.heap.pop();
                        state.pending.remove(&key);
                        state.processing.insert(key.clone());
                        return Some(key);
                    }
                    next_at = Some(at);
                    break;
                }
                next_at
            };

            match next_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a key returned by `pop`, rescheduling any parked re-add
    pub fn done(&self, key: &ObjectRef) {
        let rescheduled = {
            let mut state = self.lock();
            state.processing.remove(key);
            match state.dirty.remove(key) {
                Some(at) if !state.shutdown => {
                    let earlier = state.pending.get(key).map_or(true, |(p, _)| at < *p);
                    if earlier {
                        state.schedule(key.clone(), at);
                    }
                    true
                }
                _ => false,
            }
        };
        if rescheduled {
            self.notify.notify_one();
        }
    }

    /// Keys waiting to be processed (not counting in-flight keys)
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod tests;
