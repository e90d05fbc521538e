//! JSON control API
//!
//! Thin axum wrappers over `ControlPlane`. Every error is reported as an
//! `ErrorResponse` whose `code` the CLI maps back to an exit status.

use crate::controller::{ControlError, ControlPlane, RolloutStatus};
use crate::model::{DesiredSpec, FieldOwner, RevisionRef};
use crate::store::StoreError;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Error body returned by every control endpoint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::WorkloadNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::NoActiveRollout { .. } => StatusCode::CONFLICT,
            ControlError::InvalidRevision(_) | ControlError::InvalidSpec(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ControlError::Ownership(_) => StatusCode::CONFLICT,
            ControlError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
            ControlError::Store(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "Control request failed");
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct WriterQuery {
    /// Writer identity for field ownership, defaults to the operator
    pub writer: Option<FieldOwner>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SpecAccepted {
    pub workload: String,
    pub generation: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RollbackRequest {
    /// Revision id, sequence number or "previous"; absent means previous
    #[serde(default)]
    pub revision: Option<String>,
}

type ApiResult<T> = Result<Json<T>, ControlError>;

async fn list_workloads(State(control): State<Arc<ControlPlane>>) -> ApiResult<Vec<RolloutStatus>> {
    Ok(Json(control.list().await?))
}

async fn get_status(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
) -> ApiResult<RolloutStatus> {
    Ok(Json(control.status(&name).await?))
}

async fn put_spec(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
    Query(query): Query<WriterQuery>,
    Json(mut spec): Json<DesiredSpec>,
) -> ApiResult<SpecAccepted> {
    // The path names the workload
    spec.workload = name.clone();
    let writer = query.writer.unwrap_or(FieldOwner::Operator);
    let generation = control.put_spec(spec, writer).await?;
    Ok(Json(SpecAccepted {
        workload: name,
        generation,
    }))
}

async fn delete_spec(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ControlError> {
    control.delete_spec(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
) -> ApiResult<RolloutStatus> {
    Ok(Json(control.pause(&name).await?))
}

async fn resume(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
) -> ApiResult<RolloutStatus> {
    Ok(Json(control.resume(&name).await?))
}

async fn promote(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
) -> ApiResult<RolloutStatus> {
    Ok(Json(control.promote(&name).await?))
}

async fn rollback(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
    body: Option<Json<RollbackRequest>>,
) -> ApiResult<RolloutStatus> {
    let reference = match body.and_then(|Json(req)| req.revision) {
        Some(raw) => match raw.parse::<RevisionRef>() {
            Ok(reference) => reference,
            Err(never) => match never {},
        },
        None => RevisionRef::Previous,
    };
    Ok(Json(control.rollback(&name, &reference).await?))
}

/// Routes under `/api/v1`
pub fn routes(control: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/api/v1/workloads", get(list_workloads))
        .route(
            "/api/v1/workloads/{name}",
            get(get_status).put(put_spec).delete(delete_spec),
        )
        .route("/api/v1/workloads/{name}/pause", post(pause))
        .route("/api/v1/workloads/{name}/resume", post(resume))
        .route("/api/v1/workloads/{name}/promote", post(promote))
        .route("/api/v1/workloads/{name}/rollback", post(rollback))
        .with_state(control)
}
