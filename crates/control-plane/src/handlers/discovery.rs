//! Discovery handlers: registered apps, triggers and actions, and resource
//! search for dynamic fields.

use axum::{
    extract::{Query, State},
    Json,
};
use funnelflow_actions::{ActionDescriptor, AppDescriptor, TriggerDescriptor};

use crate::engine::{ResourceSearchRequest, ResourceSearchResponse};
use crate::error::AppResult;
use crate::services::{DiscoveryQuery, DiscoveryService};

/// `GET /discovered/apps`
pub async fn apps(State(service): State<DiscoveryService>) -> Json<Vec<AppDescriptor>> {
    Json(service.apps())
}

/// `GET /discovered/triggers?app_key=`
pub async fn triggers(
    State(service): State<DiscoveryService>,
    Query(query): Query<DiscoveryQuery>,
) -> Json<Vec<TriggerDescriptor>> {
    Json(service.triggers(&query))
}

/// `GET /discovered/actions?app_key=`
pub async fn actions(
    State(service): State<DiscoveryService>,
    Query(query): Query<DiscoveryQuery>,
) -> Json<Vec<ActionDescriptor>> {
    Json(service.actions(&query))
}

/// Search choices for dynamic fields, one result per field.
///
/// `POST /discovered/resources/search`
///
/// ```json
/// {
///   "app_key": "rest",
///   "integration_id": 4,
///   "fields": [{"field": "record", "resource_key": "records", "query": "jane"}]
/// }
/// ```
pub async fn search_resources(
    State(service): State<DiscoveryService>,
    Json(request): Json<ResourceSearchRequest>,
) -> AppResult<Json<ResourceSearchResponse>> {
    Ok(Json(service.search(request).await?))
}
