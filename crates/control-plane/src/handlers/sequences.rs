//! Sequence configuration API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::db::models::{
    ActionCreateRequest, ActionMoveRequest, PositionVariables, Sequence, SequenceAction,
    SequenceCreateRequest, SequenceDetail, SequenceListQuery, SequenceTrigger,
    SequenceUpdateRequest, TriggerCreateRequest, TriggerTestResponse, WorkflowStep,
};
use crate::error::AppResult;
use crate::services::SequenceService;

/// `POST /sequences`
pub async fn create(
    State(service): State<SequenceService>,
    Json(request): Json<SequenceCreateRequest>,
) -> AppResult<(StatusCode, Json<Sequence>)> {
    let sequence = service.create(request).await?;
    Ok((StatusCode::CREATED, Json(sequence)))
}

/// `GET /sequences?tenant_id=`
pub async fn list(
    State(service): State<SequenceService>,
    Query(query): Query<SequenceListQuery>,
) -> AppResult<Json<Vec<Sequence>>> {
    Ok(Json(service.list(query.tenant_id.as_deref()).await?))
}

/// Sequence with its triggers and ordered actions.
///
/// `GET /sequences/{id}`
pub async fn get(
    State(service): State<SequenceService>,
    Path(id): Path<i64>,
) -> AppResult<Json<SequenceDetail>> {
    Ok(Json(service.get(id).await?))
}

/// `PATCH /sequences/{id}` with `{"enabled": false}`
pub async fn update(
    State(service): State<SequenceService>,
    Path(id): Path<i64>,
    Json(request): Json<SequenceUpdateRequest>,
) -> AppResult<Json<Sequence>> {
    Ok(Json(service.set_enabled(id, request.enabled).await?))
}

/// `DELETE /sequences/{id}`
pub async fn delete(
    State(service): State<SequenceService>,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    service.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Add a trigger.
///
/// `POST /sequences/{id}/triggers`
///
/// ```json
/// {
///   "app_key": "checkout",
///   "trigger_key": "purchase_completed",
///   "configuration": {"funnel_id": "f-1"},
///   "conditions": {"amount": {"gte": 1000}}
/// }
/// ```
pub async fn add_trigger(
    State(service): State<SequenceService>,
    Path(id): Path<i64>,
    Json(request): Json<TriggerCreateRequest>,
) -> AppResult<(StatusCode, Json<SequenceTrigger>)> {
    let trigger = service.add_trigger(id, request).await?;
    Ok((StatusCode::CREATED, Json(trigger)))
}

/// `DELETE /sequences/{id}/triggers/{trigger_id}`
pub async fn delete_trigger(
    State(service): State<SequenceService>,
    Path((id, trigger_id)): Path<(i64, i64)>,
) -> AppResult<StatusCode> {
    service.delete_trigger(id, trigger_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run the trigger's test and store the payload as its sample.
///
/// `POST /sequences/{id}/triggers/{trigger_id}/test`
pub async fn test_trigger(
    State(service): State<SequenceService>,
    Path((id, trigger_id)): Path<(i64, i64)>,
) -> AppResult<Json<TriggerTestResponse>> {
    Ok(Json(service.test_trigger(id, trigger_id).await?))
}

/// Add an action, appended unless `position` is given.
///
/// `POST /sequences/{id}/actions`
///
/// ```json
/// {
///   "app_key": "webhook",
///   "action_key": "send",
///   "configuration": {
///     "url": "https://hooks.example.com/welcome",
///     "payload": {"email": "{{trigger.member_email}}"}
///   }
/// }
/// ```
pub async fn add_action(
    State(service): State<SequenceService>,
    Path(id): Path<i64>,
    Json(request): Json<ActionCreateRequest>,
) -> AppResult<(StatusCode, Json<SequenceAction>)> {
    let action = service.add_action(id, request).await?;
    Ok((StatusCode::CREATED, Json(action)))
}

/// Delete an action; returns the remaining actions renumbered.
///
/// `DELETE /sequences/{id}/actions/{action_id}`
pub async fn delete_action(
    State(service): State<SequenceService>,
    Path((id, action_id)): Path<(i64, i64)>,
) -> AppResult<Json<Vec<SequenceAction>>> {
    Ok(Json(service.delete_action(id, action_id).await?))
}

/// `PUT /sequences/{id}/actions/{action_id}/position` with `{"position": 1}`
pub async fn move_action(
    State(service): State<SequenceService>,
    Path((id, action_id)): Path<(i64, i64)>,
    Json(request): Json<ActionMoveRequest>,
) -> AppResult<Json<Vec<SequenceAction>>> {
    Ok(Json(service.move_action(id, action_id, request.position).await?))
}

/// Execute the action once against the stored samples. No run is created.
///
/// `POST /sequences/{id}/actions/{action_id}/test`
pub async fn test_action(
    State(service): State<SequenceService>,
    Path((id, action_id)): Path<(i64, i64)>,
) -> AppResult<Json<WorkflowStep>> {
    Ok(Json(service.test_action(id, action_id).await?))
}

/// `GET /sequences/{id}/variables`
pub async fn variables(
    State(service): State<SequenceService>,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<PositionVariables>>> {
    Ok(Json(service.variables(id).await?))
}
