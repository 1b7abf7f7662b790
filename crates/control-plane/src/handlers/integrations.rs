//! Integration API handlers.
//!
//! Connections to third-party apps. Credentials are write-only: responses
//! only say whether credentials are stored.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::db::models::{
    IntegrationCreateRequest, IntegrationResponse, IntegrationStateRequest,
    IntegrationTestResponse,
};
use crate::error::AppResult;
use crate::services::IntegrationService;

/// Query parameters for listing integrations.
#[derive(Debug, Deserialize, Default)]
pub struct ListIntegrationsQuery {
    pub tenant_id: Option<String>,
}

/// Create an integration in state `created`.
///
/// `POST /integrations`
///
/// ```json
/// {
///   "tenant_id": "acme",
///   "app_key": "rest",
///   "name": "CRM",
///   "credentials": {"type": "bearer", "token": "..."},
///   "config": {"base_url": "https://crm.example.com"}
/// }
/// ```
pub async fn create(
    State(service): State<IntegrationService>,
    Json(request): Json<IntegrationCreateRequest>,
) -> AppResult<(StatusCode, Json<IntegrationResponse>)> {
    let response = service.create(request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// `GET /integrations`
pub async fn list(
    State(service): State<IntegrationService>,
    Query(query): Query<ListIntegrationsQuery>,
) -> AppResult<Json<Vec<IntegrationResponse>>> {
    Ok(Json(service.list(query.tenant_id.as_deref()).await?))
}

/// `GET /integrations/{id}`
pub async fn get(
    State(service): State<IntegrationService>,
    Path(id): Path<i64>,
) -> AppResult<Json<IntegrationResponse>> {
    Ok(Json(service.get(id).await?))
}

/// `DELETE /integrations/{id}`
pub async fn delete(
    State(service): State<IntegrationService>,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    service.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Test the stored credentials against the app.
///
/// `POST /integrations/{id}/test`
///
/// A failed test is not an HTTP error: the response carries
/// `success: false` and the integration moves to `error`.
pub async fn test(
    State(service): State<IntegrationService>,
    Path(id): Path<i64>,
) -> AppResult<Json<IntegrationTestResponse>> {
    Ok(Json(service.test(id).await?))
}

/// Enable or disable an integration.
///
/// `PUT /integrations/{id}/state` with `{"enabled": false}`
pub async fn set_state(
    State(service): State<IntegrationService>,
    Path(id): Path<i64>,
    Json(request): Json<IntegrationStateRequest>,
) -> AppResult<Json<IntegrationResponse>> {
    Ok(Json(service.set_enabled(id, request.enabled).await?))
}
