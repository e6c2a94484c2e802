//! Poll-based REST surface: reserve, ack, progress,
//! list-inflight, submit-result, status.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::broker::{AckOutcome, ProgressOutcome, SubmitOutcome};
use crate::http::HttpError;
use crate::model::{ClientId, DispatchResult, Frame, TaskId, WorkspaceId};
use crate::AppState;

pub fn make_router<S>(state: AppState) -> Router<S> {
    Router::new()
        .route("/reserve", post(reserve))
        .route("/ack", post(ack))
        .route("/progress", post(progress))
        .route("/inflight", get(list_inflight))
        .route("/submit", post(submit))
        .route("/status", get(status))
        .route("/workspaces/{workspace_id}/assign", post(assign))
        .route("/workspaces/{workspace_id}/unassign", post(unassign))
        .with_state(state)
}

const DEFAULT_RESERVE_LIMIT: usize = 1;
const DEFAULT_LEASE_SECONDS: u64 = 60;
/// Bound on how long a reserve call may long-poll before returning an empty
/// list; the orchestration backend is expected to re-poll after this.
const RESERVE_LONG_POLL: Duration = Duration::from_secs(20);

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub workspace_id: WorkspaceId,
    pub client_id: ClientId,
    pub surface_type: Option<SmolStr>,
    pub limit: Option<usize>,
    pub lease_seconds: Option<u64>,
}

#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/reserve",
    request_body = ReserveRequest,
    responses((status = 200, description = "Opaque task payloads, each with a lease_id injected")),
))]
pub(crate) async fn reserve(State(state): State<AppState>, Json(req): Json<ReserveRequest>) -> Result<Json<Vec<Frame>>, HttpError> {
    let limit = req.limit.unwrap_or(DEFAULT_RESERVE_LIMIT).max(1);
    let lease_seconds = req.lease_seconds.unwrap_or(DEFAULT_LEASE_SECONDS);

    let tasks = state
        .broker
        .reserve(req.workspace_id.clone(), req.client_id.clone(), req.surface_type.clone(), limit, lease_seconds)
        .await
        .map_err(HttpError::internal().err())?;

    if !tasks.is_empty() {
        return Ok(Json(tasks));
    }

    // Nothing immediately available: wait for an enqueue notification (or a
    // bounded timeout) before returning an empty list, so pollers don't
    // busy-loop against the broker.
    let notify = state.broker.pending_wakeup(req.workspace_id.clone()).await.map_err(HttpError::internal().err())?;

    let _ = tokio::time::timeout(RESERVE_LONG_POLL, crate::broker::wait_for_enqueue(notify)).await;

    let tasks = state.broker.reserve(req.workspace_id, req.client_id, req.surface_type, limit, lease_seconds).await.map_err(HttpError::internal().err())?;

    Ok(Json(tasks))
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub execution_id: TaskId,
    pub lease_id: SmolStr,
    pub client_id: Option<ClientId>,
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub execution_id: TaskId,
    pub lease_id: SmolStr,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>))]
    pub lease_expires_at: Option<time::OffsetDateTime>,
    pub status: &'static str,
}

#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/ack",
    request_body = AckRequest,
    responses((status = 200, body = Option<AckResponse>)),
))]
pub(crate) async fn ack(State(state): State<AppState>, Json(req): Json<AckRequest>) -> Result<Json<Option<AckResponse>>, HttpError> {
    let (outcome, deadline) = state
        .broker
        .ack_lease(req.execution_id.clone(), req.lease_id.clone(), req.client_id)
        .await
        .map_err(HttpError::internal().err())?;

    let status = match outcome {
        AckOutcome::Acked => "acked",
        AckOutcome::AlreadyAcked => "already_acked",
        AckOutcome::AlreadyCompleted => "already_completed",
        AckOutcome::Rejected => return Ok(Json(None)),
    };

    Ok(Json(Some(AckResponse { execution_id: req.execution_id, lease_id: req.lease_id, lease_expires_at: deadline, status })))
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub execution_id: TaskId,
    pub lease_id: SmolStr,
    #[serde(default)]
    pub progress_pct: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    pub client_id: Option<ClientId>,
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub execution_id: TaskId,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>))]
    pub lease_expires_at: Option<time::OffsetDateTime>,
    pub status: &'static str,
}

#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/progress",
    request_body = ProgressRequest,
    responses((status = 200, body = Option<ProgressResponse>)),
))]
pub(crate) async fn progress(State(state): State<AppState>, Json(req): Json<ProgressRequest>) -> Result<Json<Option<ProgressResponse>>, HttpError> {
    let (outcome, deadline) = state
        .broker
        .progress_lease(req.execution_id.clone(), req.lease_id, req.client_id)
        .await
        .map_err(HttpError::internal().err())?;

    let status = match outcome {
        ProgressOutcome::Ok => "ok",
        ProgressOutcome::LeaseCapExceeded => "lease_cap_exceeded",
        ProgressOutcome::Rejected => return Ok(Json(None)),
    };

    Ok(Json(Some(ProgressResponse { execution_id: req.execution_id, lease_expires_at: deadline, status })))
}

#[cfg_attr(feature = "openapi", derive(utoipa::IntoParams))]
#[derive(Debug, Deserialize)]
pub struct ListInflightQuery {
    pub client_id: ClientId,
}

#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/inflight",
    params(ListInflightQuery),
    responses((status = 200, description = "Task payloads with lease_id, acked, lease_expires_at merged in")),
))]
pub(crate) async fn list_inflight(State(state): State<AppState>, Query(query): Query<ListInflightQuery>) -> Result<Json<Vec<Frame>>, HttpError> {
    let out = state.broker.list_inflight(query.client_id).await.map_err(HttpError::internal().err())?;
    Ok(Json(out))
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub execution_id: TaskId,
    pub result_data: DispatchResult,
    pub client_id: Option<ClientId>,
    pub lease_id: Option<SmolStr>,
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<WorkspaceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/submit",
    request_body = SubmitRequest,
    responses((status = 200, body = Option<SubmitResponse>)),
))]
pub(crate) async fn submit(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> Result<Json<Option<SubmitResponse>>, HttpError> {
    let outcome = state
        .broker
        .submit_result(req.execution_id.clone(), req.result_data, req.client_id, req.lease_id)
        .await
        .map_err(HttpError::internal().err())?;

    match outcome {
        SubmitOutcome::Accepted { workspace_id, duplicate } => Ok(Json(Some(SubmitResponse {
            accepted: true,
            duplicate: Some(duplicate),
            workspace_id,
            task_id: Some(req.execution_id),
        }))),
        SubmitOutcome::UnknownTask => Ok(Json(None)),
    }
}

#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/status",
    responses((status = 200, body = crate::broker::StatusSnapshot)),
))]
pub(crate) async fn status(State(state): State<AppState>) -> Result<Json<crate::broker::StatusSnapshot>, HttpError> {
    let snapshot = state.broker.status().await.map_err(HttpError::internal().err())?;
    Ok(Json(snapshot))
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub owner_user_id: Option<SmolStr>,
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub sent: usize,
}

async fn assign(
    State(state): State<AppState>,
    axum::extract::Path(workspace_id): axum::extract::Path<WorkspaceId>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<BroadcastResponse>, HttpError> {
    let sent = state.broker.broadcast_assign(workspace_id, req.owner_user_id).await.map_err(HttpError::internal().err())?;
    Ok(Json(BroadcastResponse { sent }))
}

async fn unassign(
    State(state): State<AppState>,
    axum::extract::Path(workspace_id): axum::extract::Path<WorkspaceId>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<BroadcastResponse>, HttpError> {
    let sent = state.broker.broadcast_unassign(workspace_id, req.owner_user_id).await.map_err(HttpError::internal().err())?;
    Ok(Json(BroadcastResponse { sent }))
}
