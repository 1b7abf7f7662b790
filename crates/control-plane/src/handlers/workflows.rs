//! Workflow run API handlers: the run ledger and operator recovery.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::db::models::{RecoveryOutcome, RunDetail, RunFilter, RunListResponse};
use crate::error::AppResult;
use crate::services::WorkflowService;

/// List runs, newest first.
///
/// `GET /workflows?sequence_id=&status=&limit=&offset=`
pub async fn list(
    State(service): State<WorkflowService>,
    Query(filter): Query<RunFilter>,
) -> AppResult<Json<RunListResponse>> {
    Ok(Json(service.list(filter).await?))
}

/// Run with all steps, its log and a summary of the current attempt.
///
/// `GET /workflows/{id}`
pub async fn get(
    State(service): State<WorkflowService>,
    Path(id): Path<i64>,
) -> AppResult<Json<RunDetail>> {
    Ok(Json(service.detail(id).await?))
}

/// Recovery responses: `202 Accepted` when performed, `409 Conflict` with
/// the reason otherwise.
fn recovery_response(outcome: RecoveryOutcome) -> (StatusCode, Json<RecoveryOutcome>) {
    let status = if outcome.performed {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(outcome))
}

/// Resume a failed or waiting run in its current attempt.
///
/// `POST /workflows/{id}/rerun`
pub async fn rerun(
    State(service): State<WorkflowService>,
    Path(id): Path<i64>,
) -> AppResult<(StatusCode, Json<RecoveryOutcome>)> {
    Ok(recovery_response(service.rerun(id).await?))
}

/// Abort a pending or running run and start a fresh attempt.
///
/// `POST /workflows/{id}/force-rerun`
pub async fn force_rerun(
    State(service): State<WorkflowService>,
    Path(id): Path<i64>,
) -> AppResult<(StatusCode, Json<RecoveryOutcome>)> {
    Ok(recovery_response(service.force_rerun(id).await?))
}

/// `POST /workflows/{id}/cancel`
pub async fn cancel(
    State(service): State<WorkflowService>,
    Path(id): Path<i64>,
) -> AppResult<(StatusCode, Json<RecoveryOutcome>)> {
    Ok(recovery_response(service.cancel(id).await?))
}
