//! Kind-tagged dispatch table of reconcilers

use super::reconcile::{Reconciler, ResourceKind};
use super::revision::RevisionPruner;
use super::rollout::RolloutOrchestrator;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("reconciler for {0:?} already registered")]
    Duplicate(ResourceKind),
}

#[derive(Default, Clone)]
pub struct ReconcilerRegistry {
    entries: HashMap<ResourceKind, Arc<dyn Reconciler>>,
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the rollout orchestrator and the revision pruner
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.entries.insert(
            ResourceKind::Workload,
            Arc::new(RolloutOrchestrator::new()),
        );
        registry
            .entries
            .insert(ResourceKind::History, Arc::new(RevisionPruner));
        registry
    }

    pub fn register(&mut self, reconciler: Arc<dyn Reconciler>) -> Result<(), RegistryError> {
        let kind = reconciler.kind();
        if self.entries.contains_key(&kind) {
            return Err(RegistryError::Duplicate(kind));
        }
        self.entries.insert(kind, reconciler);
        Ok(())
    }

    pub fn get(&self, kind: ResourceKind) -> Option<Arc<dyn Reconciler>> {
        self.entries.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self.entries.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_all_kinds() {
        let registry = ReconcilerRegistry::standard();
        assert_eq!(
            registry.kinds(),
            vec![ResourceKind::Workload, ResourceKind::History]
        );
        assert_eq!(
            registry.get(ResourceKind::History).map(|r| r.kind()),
            Some(ResourceKind::History)
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ReconcilerRegistry::standard();
        let err = registry
            .register(Arc::new(RevisionPruner))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(ResourceKind::History));
    }

    #[test]
    fn test_empty_registry() {
        let mut registry = ReconcilerRegistry::new();
        assert!(registry.get(ResourceKind::Workload).is_none());
        registry.register(Arc::new(RevisionPruner)).unwrap();
        assert!(registry.get(ResourceKind::History).is_some());
    }
}
