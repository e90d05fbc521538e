//! Scale planning under surge and availability bounds
//!
//! Given the instances observed at the start of a tick and the per-revision
//! replica goals, compute which instances to create and which to delete.
//! The plan is pure and deterministic; the orchestrator dispatches it.

use super::surge::SurgeBounds;
use std::collections::{BTreeMap, HashSet};

/// An instance as seen at the start of a tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observed {
    pub id: String,
    pub revision: String,
    pub ready: bool,
    /// Reported Failed or failed repeated health checks after being Ready
    pub failed: bool,
    /// Deletion already in progress
    pub terminating: bool,
}

/// Desired instance count for one revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleGoal {
    pub revision: String,
    pub replicas: u32,
}

impl ScaleGoal {
    pub fn new(revision: impl Into<String>, replicas: u32) -> Self {
        ScaleGoal {
            revision: revision.into(),
            replicas,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedCreate {
    pub id: String,
    pub revision: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub creates: Vec<PlannedCreate>,
    pub deletes: Vec<String>,
}

impl ScalePlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }
}

/// Instance id for a revision: `{revision}-{n}` with the smallest unused n
fn next_instance_id(revision: &str, taken: &mut HashSet<String>) -> String {
    let mut n = 0u32;
    loop {
        let id = format!("{}-{}", revision, n);
        if taken.insert(id.clone()) {
            return id;
        }
        n += 1;
    }
}

/// Compute this tick's creates and deletes
///
/// - failed instances are always deleted (they are not ready, so this never
///   lowers availability)
/// - creates fill goals in order, bounded by `desired + maxSurge - total`
///   where total counts every existing instance
/// - excess instances are deleted, revisions without a goal first, unready
///   instances before ready ones; ready deletions are bounded by
///   `ready - (desired - maxUnavailable)`
pub fn plan_scale(observed: &[Observed], goals: &[ScaleGoal], bounds: &SurgeBounds) -> ScalePlan {
    let mut plan = ScalePlan::default();
    let mut taken: HashSet<String> = observed.iter().map(|o| o.id.clone()).collect();

    let total = observed.len() as u32;
    let ready = observed.iter().filter(|o| o.ready && !o.failed).count() as u32;

    // Live instances grouped by revision; BTreeMap keeps the plan deterministic
    let mut by_revision: BTreeMap<&str, Vec<&Observed>> = BTreeMap::new();
    for o in observed {
        if o.failed {
            if !o.terminating {
                plan.deletes.push(o.id.clone());
            }
            continue;
        }
        if o.terminating {
            continue;
        }
        by_revision.entry(o.revision.as_str()).or_default().push(o);
    }

    let mut can_create = bounds.max_total().saturating_sub(total);
    for goal in goals {
        let have = by_revision.get(goal.revision.as_str()).map_or(0, |v| v.len()) as u32;
        let n = goal.replicas.saturating_sub(have).min(can_create);
        for _ in 0..n {
            plan.creates.push(PlannedCreate {
                id: next_instance_id(&goal.revision, &mut taken),
                revision: goal.revision.clone(),
            });
        }
        can_create -= n;
    }

    let goal_of = |revision: &str| {
        goals
            .iter()
            .find(|g| g.revision == revision)
            .map(|g| g.replicas)
    };

    // Revisions without a goal are drained first, then goals from the back
    let mut order: Vec<&str> = by_revision
        .keys()
        .copied()
        .filter(|r| goal_of(r).is_none())
        .collect();
    order.extend(goals.iter().rev().map(|g| g.revision.as_str()));

    let mut ready_budget = ready.saturating_sub(bounds.min_ready());
    for revision in order {
        let Some(instances) = by_revision.get(revision) else {
            continue;
        };
        let keep = goal_of(revision).unwrap_or(0) as usize;
        let mut excess = instances.len().saturating_sub(keep);
        if excess == 0 {
            continue;
        }

        let mut candidates: Vec<&&Observed> = instances.iter().collect();
        // Unready first, then newest-looking ids first among equals
        candidates.sort_by(|a, b| a.ready.cmp(&b.ready).then_with(|| b.id.cmp(&a.id)));

        for candidate in candidates {
            if excess == 0 {
                break;
            }
            if candidate.ready {
                if ready_budget == 0 {
                    break;
                }
                ready_budget -= 1;
            }
            plan.deletes.push(candidate.id.clone());
            excess -= 1;
        }
    }

    plan
}

/// Check a plan against the hard bounds before anything is dispatched
///
/// Creates must keep total instances within `desired + maxSurge`, deletes
/// must not take ready instances below `desired - maxUnavailable`, and every
/// id must be unique and refer to a known (or new) instance.
pub fn verify_plan(observed: &[Observed], plan: &ScalePlan, bounds: &SurgeBounds) -> Result<(), String> {
    let known: HashSet<&str> = observed.iter().map(|o| o.id.as_str()).collect();

    let mut seen = HashSet::new();
    for create in &plan.creates {
        if known.contains(create.id.as_str()) || !seen.insert(create.id.as_str()) {
            return Err(format!("duplicate instance id {}", create.id));
        }
    }
    let mut deleted = HashSet::new();
    for id in &plan.deletes {
        if !known.contains(id.as_str()) {
            return Err(format!("delete of unknown instance {}", id));
        }
        if !deleted.insert(id.as_str()) {
            return Err(format!("instance {} deleted twice", id));
        }
    }

    let total = observed.len() as u32;
    let peak = total + plan.creates.len() as u32;
    if !plan.creates.is_empty() && peak > bounds.max_total() {
        return Err(format!(
            "{} instances would exceed desired {} + maxSurge {}",
            peak, bounds.desired, bounds.max_surge
        ));
    }

    let ready = observed.iter().filter(|o| o.ready && !o.failed).count() as u32;
    let ready_deleted = observed
        .iter()
        .filter(|o| o.ready && !o.failed && deleted.contains(o.id.as_str()))
        .count() as u32;
    if ready_deleted > 0 && ready - ready_deleted < bounds.min_ready() {
        return Err(format!(
            "deleting {} ready instances leaves {} < desired {} - maxUnavailable {}",
            ready_deleted,
            ready - ready_deleted,
            bounds.desired,
            bounds.max_unavailable
        ));
    }

    Ok(())
}

/// Instances per revision once the plan has been applied
///
/// Failed and terminating instances are not counted.
pub fn projected_counts(observed: &[Observed], plan: &ScalePlan) -> BTreeMap<String, u32> {
    let deleted: HashSet<&str> = plan.deletes.iter().map(String::as_str).collect();
    let mut counts = BTreeMap::new();
    for o in observed {
        if o.failed || o.terminating || deleted.contains(o.id.as_str()) {
            continue;
        }
        *counts.entry(o.revision.clone()).or_insert(0) += 1;
    }
    for create in &plan.creates {
        *counts.entry(create.revision.clone()).or_insert(0) += 1;
    }
    counts
}

/// Ready instances per revision that survive the plan
pub fn projected_ready(observed: &[Observed], plan: &ScalePlan) -> BTreeMap<String, u32> {
    let deleted: HashSet<&str> = plan.deletes.iter().map(String::as_str).collect();
    let mut counts = BTreeMap::new();
    for o in observed {
        if o.ready && !o.failed && !deleted.contains(o.id.as_str()) {
            *counts.entry(o.revision.clone()).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
#[path = "plan_test.rs"]
mod tests;
