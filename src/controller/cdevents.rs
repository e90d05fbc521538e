//! CDEvents emission for rollout observability.
//!
//! Phase transitions map onto service events:
//! start of an update -> service.deployed, canary step -> service.upgraded,
//! Failed/RolledBack -> service.rolledback, Completed -> service.published.

use crate::model::{DesiredSpec, Phase, RolloutState};
use async_trait::async_trait;
use cloudevents::Event;
use serde_json::json;
use thiserror::Error;

const EVENT_SOURCE: &str = "https://kulku.dev";
const SUBJECT_SOURCE: &str = "https://kulku.dev/controller";

#[derive(Debug, Error)]
pub enum CDEventsError {
    #[error("cdevents error: {0}")]
    Generic(String),
}

/// Trait for sending CDEvents
///
/// Production code uses `HttpEventSink` which sends events via HTTP POST.
/// Tests use `MockEventSink` which stores events in memory for assertions.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &Event) -> Result<(), CDEventsError>;
}

/// Production event sink that sends CloudEvents via HTTP POST
pub struct HttpEventSink {
    enabled: bool,
    sink_url: Option<String>,
    client: reqwest::Client,
}

impl HttpEventSink {
    /// Emission is skipped unless `enabled` and a sink URL are both set
    pub fn new(enabled: bool, sink_url: Option<String>) -> Self {
        HttpEventSink {
            enabled,
            sink_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, None)
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send(&self, event: &Event) -> Result<(), CDEventsError> {
        if !self.enabled {
            return Ok(());
        }

        let Some(url) = &self.sink_url else {
            return Ok(());
        };

        self.client
            .post(url)
            .header("Content-Type", "application/cloudevents+json")
            .json(event)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| CDEventsError::Generic(format!("HTTP POST failed: {}", e)))?;

        Ok(())
    }
}

/// Mock event sink for testing - stores events in memory
#[cfg(test)]
pub struct MockEventSink {
    events: std::sync::Arc<std::sync::Mutex<Vec<Event>>>,
}

#[cfg(test)]
impl Default for MockEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl MockEventSink {
    pub fn new() -> Self {
        MockEventSink {
            events: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    #[allow(clippy::unwrap_used)]
    pub fn get_emitted_events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for MockEventSink {
    async fn send(&self, event: &Event) -> Result<(), CDEventsError> {
        #[allow(clippy::unwrap_used)]
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceEvent {
    Deployed,
    Upgraded,
    RolledBack,
    Published,
}

/// Decide which service events a transition produces
fn classify(old: Option<&RolloutState>, new: &RolloutState) -> Vec<ServiceEvent> {
    let old_phase = old.map(|o| o.phase).unwrap_or(Phase::Idle);

    let started = matches!(new.phase, Phase::Progressing | Phase::Analyzing)
        && ((!old_phase.is_active() && old_phase != Phase::Paused)
            || old.and_then(|o| o.target_revision.as_deref()) != new.target_revision.as_deref());

    if started {
        return vec![ServiceEvent::Deployed];
    }

    let step_index = |s: &RolloutState| s.canary.as_ref().map(|c| c.step_index);
    let stepped = (new.phase == Phase::Analyzing
        && old_phase == Phase::Analyzing
        && old.map(step_index) != Some(step_index(new)))
        || (new.phase == Phase::Promoting && old_phase == Phase::Analyzing);

    if stepped {
        return vec![ServiceEvent::Upgraded];
    }

    if new.phase == old_phase {
        return Vec::new();
    }

    match new.phase {
        Phase::Failed | Phase::RolledBack => vec![ServiceEvent::RolledBack],
        // An initial deploy can complete within one tick
        Phase::Completed if old.is_none() => vec![ServiceEvent::Deployed, ServiceEvent::Published],
        Phase::Completed => vec![ServiceEvent::Published],
        _ => Vec::new(),
    }
}

/// Emit CDEvents based on a rollout state transition
///
/// This function determines which CDEvent to emit based on the phase transition
/// and sends it to the configured sink.
pub async fn emit_status_change_event(
    spec: &DesiredSpec,
    old: Option<&RolloutState>,
    new: &RolloutState,
    sink: &dyn EventSink,
) -> Result<(), CDEventsError> {
    for kind in classify(old, new) {
        let event = build_event(kind, spec, new)?;
        sink.send(&event).await?;
    }
    Ok(())
}

/// Convert a value into a CDEvents field type, mapping the error
macro_rules! field {
    ($value:expr, $what:literal) => {
        $value
            .try_into()
            .map_err(|e| CDEventsError::Generic(format!("Invalid {}: {}", $what, e)))?
    };
}

fn build_event(
    kind: ServiceEvent,
    spec: &DesiredSpec,
    state: &RolloutState,
) -> Result<Event, CDEventsError> {
    use cdevents_sdk::latest::{
        service_deployed, service_published, service_rolledback, service_upgraded,
    };
    use cdevents_sdk::{CDEvent, Subject};

    let workload = state.workload.as_str();
    let revision = state
        .live_revision()
        .ok_or_else(|| CDEventsError::Generic("rollout has no revision".to_string()))?;
    let artifact_id = format!("pkg:generic/{}@{}", workload, revision);
    let env_id = workload.to_string();
    let env_source = format!("/workloads/{}", workload);

    let (subject, subject_suffix, decision) = match kind {
        ServiceEvent::Deployed => (
            Subject::from(service_deployed::Content {
                artifact_id: field!(artifact_id, "artifact_id"),
                environment: service_deployed::ContentEnvironment {
                    id: field!(env_id, "environment id"),
                    source: Some(field!(env_source, "environment source")),
                },
            }),
            "deployed",
            "initialization",
        ),
        ServiceEvent::Upgraded => (
            Subject::from(service_upgraded::Content {
                artifact_id: field!(artifact_id, "artifact_id"),
                environment: service_upgraded::ContentEnvironment {
                    id: field!(env_id, "environment id"),
                    source: Some(field!(env_source, "environment source")),
                },
            }),
            "step",
            "step_advanced",
        ),
        ServiceEvent::RolledBack => (
            Subject::from(service_rolledback::Content {
                artifact_id: field!(artifact_id, "artifact_id"),
                environment: service_rolledback::ContentEnvironment {
                    id: field!(env_id, "environment id"),
                    source: Some(field!(env_source, "environment source")),
                },
            }),
            "rollback",
            if state.phase == Phase::Failed {
                "progress_deadline_exceeded"
            } else {
                "analysis_failed"
            },
        ),
        ServiceEvent::Published => (
            Subject::from(service_published::Content {
                environment: Some(service_published::ContentEnvironment {
                    id: field!(env_id, "environment id"),
                    source: Some(field!(env_source, "environment source")),
                }),
            }),
            "completed",
            "completed",
        ),
    };

    let cdevent = CDEvent::from(
        subject
            .with_id(field!(
                format!("/workloads/{}/{}", workload, subject_suffix),
                "subject id"
            ))
            .with_source(field!(SUBJECT_SOURCE, "subject source")),
    )
    .with_id(field!(uuid::Uuid::new_v4().to_string(), "event id"))
    .with_source(field!(EVENT_SOURCE, "event source"))
    .with_custom_data(build_custom_data(spec, state, decision));

    let cloudevent: Event = cdevent
        .try_into()
        .map_err(|e| CDEventsError::Generic(format!("Failed to convert to CloudEvent: {}", e)))?;

    Ok(cloudevent)
}

/// Controller-specific customData attached to every event
fn build_custom_data(
    spec: &DesiredSpec,
    state: &RolloutState,
    decision_reason: &str,
) -> serde_json::Value {
    json!({
        "kulku": {
            "version": "v1",
            "workload": {
                "name": state.workload,
                "generation": spec.generation,
                "replicas": spec.replicas
            },
            "strategy": spec.policy.strategy_name(),
            "revision": {
                "current": state.current_revision,
                "target": state.target_revision
            },
            "step": {
                "index": state.canary.as_ref().map(|c| c.step_index).unwrap_or(0),
                "traffic_weight": state.traffic_weight.unwrap_or(0)
            },
            "decision": {
                "reason": decision_reason
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "cdevents_test.rs"]
mod tests;
