//! Event ingestion handler.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;

use crate::db::models::{EventIngestResponse, EventQuery};
use crate::error::AppResult;
use crate::services::EventService;

/// Ingest an event from an app.
///
/// `POST /events/{app_key}/{trigger_key}?integration_id=`
///
/// The body is the event payload. One run is created per matching trigger;
/// runs execute asynchronously.
pub async fn ingest(
    State(service): State<EventService>,
    Path((app_key, trigger_key)): Path<(String, String)>,
    Query(query): Query<EventQuery>,
    Json(payload): Json<Value>,
) -> AppResult<(StatusCode, Json<EventIngestResponse>)> {
    let response = service
        .ingest(&app_key, &trigger_key, query.integration_id, payload)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}
