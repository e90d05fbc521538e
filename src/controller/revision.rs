//! Revision history: capture, bookkeeping, retention and lookup

use super::clock::Clock;
use super::reconcile::{Context, ObjectRef, ReconcileError, ReconcileOutcome, Reconciler, ResourceKind};
use crate::model::{revision_id, DesiredSpec, Revision, RevisionRef, RevisionStatus};
use crate::store::{StateStore, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RevisionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("template hash of workload {0} is empty")]
    EmptyHash(String),

    #[error("revision {reference} of workload {workload} not found")]
    NotFound { workload: String, reference: String },
}

pub struct RevisionManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl RevisionManager {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        RevisionManager { store, clock }
    }

    pub fn from_context(ctx: &Context) -> Self {
        Self::new(ctx.store.clone(), ctx.clock.clone())
    }

    /// Return the revision for the spec's template, creating it on first sight
    ///
    /// Revisions are keyed by template hash, so re-applying an old template
    /// returns the existing revision instead of minting a new sequence number.
    /// A failed write leaves no revision behind.
    pub async fn ensure_revision(&self, spec: &DesiredSpec) -> Result<Revision, RevisionError> {
        let hash = spec.template.hash.trim();
        if hash.is_empty() {
            return Err(RevisionError::EmptyHash(spec.workload.clone()));
        }
        let id = revision_id(&spec.workload, hash);

        if let Some(existing) = self.store.get_revision(&spec.workload, &id).await? {
            return Ok(existing.value);
        }

        let sequence = self
            .store
            .list_revisions(&spec.workload)
            .await?
            .iter()
            .map(|r| r.value.sequence)
            .max()
            .unwrap_or(0)
            + 1;

        let revision = Revision {
            id: id.clone(),
            workload: spec.workload.clone(),
            sequence,
            template: spec.template.clone(),
            created_at: self.clock.now(),
            status: RevisionStatus::default(),
        };

        match self.store.put_revision(revision.clone(), None).await {
            Ok(_) => {
                info!(
                    workload = %spec.workload,
                    revision = %id,
                    sequence = sequence,
                    "Created revision"
                );
                Ok(revision)
            }
            // Lost a race with another writer capturing the same template
            Err(StoreError::Conflict { .. }) => self
                .store
                .get_revision(&spec.workload, &id)
                .await?
                .map(|r| r.value)
                .ok_or_else(|| RevisionError::NotFound {
                    workload: spec.workload.clone(),
                    reference: id,
                }),
            Err(e) => Err(e.into()),
        }
    }

    /// Revisions ordered by sequence, oldest first
    pub async fn list_revisions(&self, workload: &str) -> Result<Vec<Revision>, RevisionError> {
        Ok(self
            .store
            .list_revisions(workload)
            .await?
            .into_iter()
            .map(|r| r.value)
            .collect())
    }

    /// Delete the oldest idle revisions until at most `keep` remain
    ///
    /// Revisions that still run instances and the `protected` ones (current
    /// and target) are never deleted, so the result may exceed `keep`.
    pub async fn prune(
        &self,
        workload: &str,
        keep: usize,
        protected: &[&str],
    ) -> Result<Vec<String>, RevisionError> {
        let revisions = self.store.list_revisions(workload).await?;
        let mut excess = revisions.len().saturating_sub(keep);
        let mut deleted = Vec::new();

        for revision in &revisions {
            if excess == 0 {
                break;
            }
            let rev = &revision.value;
            if rev.status.replicas > 0 || protected.contains(&rev.id.as_str()) {
                continue;
            }
            if self.store.delete_revision(workload, &rev.id).await? {
                debug!(workload = %workload, revision = %rev.id, "Pruned revision");
                deleted.push(rev.id.clone());
            }
            excess -= 1;
        }

        Ok(deleted)
    }

    /// Record observed instance counts per revision
    ///
    /// Revisions missing from `counts` run zero instances. Only changed
    /// records are written.
    pub async fn record_replicas(
        &self,
        workload: &str,
        counts: &BTreeMap<String, u32>,
    ) -> Result<(), RevisionError> {
        for revision in self.store.list_revisions(workload).await? {
            let replicas = counts.get(&revision.value.id).copied().unwrap_or(0);
            let status = RevisionStatus {
                replicas,
                peak_replicas: revision.value.status.peak_replicas.max(replicas),
            };
            if status == revision.value.status {
                continue;
            }
            let mut updated = revision.value;
            updated.status = status;
            self.store
                .put_revision(updated, Some(revision.version))
                .await?;
        }
        Ok(())
    }

    /// Resolve a rollback target
    ///
    /// `Previous` is the highest-sequence revision other than `live` that ever
    /// ran instances.
    pub async fn resolve(
        &self,
        workload: &str,
        reference: &RevisionRef,
        live: Option<&str>,
    ) -> Result<Revision, RevisionError> {
        let revisions = self.list_revisions(workload).await?;
        let found = match reference {
            RevisionRef::Previous => revisions
                .into_iter()
                .rev()
                .find(|r| Some(r.id.as_str()) != live && r.status.peak_replicas > 0),
            RevisionRef::Id(id) => revisions.into_iter().find(|r| &r.id == id),
            RevisionRef::Sequence(seq) => revisions.into_iter().find(|r| r.sequence == *seq),
        };
        found.ok_or_else(|| RevisionError::NotFound {
            workload: workload.to_string(),
            reference: reference.to_string(),
        })
    }
}

/// Applies the retention limit of one workload's revision history
pub struct RevisionPruner;

#[async_trait]
impl Reconciler for RevisionPruner {
    fn kind(&self) -> ResourceKind {
        ResourceKind::History
    }

    async fn reconcile(
        &self,
        key: &ObjectRef,
        ctx: &Context,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let workload = key.workload.as_str();
        let keep = match ctx.store.get_spec(workload).await? {
            Some(spec) => spec
                .value
                .policy
                .revision_history_limit
                .unwrap_or(ctx.config.revision_history_limit),
            None => ctx.config.revision_history_limit,
        };

        let rollout = ctx.store.get_rollout(workload).await?.map(|r| r.value);
        let protected: Vec<&str> = rollout
            .iter()
            .flat_map(|r| [r.current_revision.as_deref(), r.target_revision.as_deref()])
            .flatten()
            .collect();

        let deleted = RevisionManager::from_context(ctx)
            .prune(workload, keep, &protected)
            .await?;
        if !deleted.is_empty() {
            info!(
                workload = %workload,
                deleted = deleted.len(),
                keep = keep,
                "Pruned revision history"
            );
        }
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
#[path = "revision_test.rs"]
mod tests;
