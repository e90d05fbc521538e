//! Change notifications for stored and observed records
//!
//! The bus is a tokio broadcast channel. Subscribers that fall behind lose
//! events (`RecvError::Lagged`); the engine's periodic resync covers the gap.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Kind of record a notification refers to
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Spec,
    Rollout,
    Revision,
    Instance,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// One add/update/delete notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub workload: String,
    /// Record name within the workload (revision id, instance id); empty for
    /// per-workload records
    pub name: String,
    pub change: ChangeType,
}

impl WatchEvent {
    pub fn new(
        kind: WatchKind,
        workload: impl Into<String>,
        name: impl Into<String>,
        change: ChangeType,
    ) -> Self {
        WatchEvent {
            kind,
            workload: workload.into(),
            name: name.into(),
            change,
        }
    }
}

const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Fan-out of watch events to every subscriber
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WatchEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: WatchEvent) {
        trace!(kind = ?event.kind, workload = %event.workload, name = %event.name, change = ?event.change, "watch event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(WatchEvent::new(WatchKind::Spec, "web", "", ChangeType::Added));

        assert_eq!(a.recv().await.unwrap().workload, "web");
        assert_eq!(b.recv().await.unwrap().change, ChangeType::Added);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(WatchEvent::new(WatchKind::Rollout, "web", "", ChangeType::Modified));
    }
}
