//! Configuration-time resource search.
//!
//! Dynamic fields offer choices fetched from the third-party app through
//! the integration. When the app requires auth and the integration is
//! missing or not active, the search is refused without calling the source.

use funnelflow_actions::{ActionError, IntegrationClient, Registry, ResourceOption};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::clients::ClientProvider;
use super::throttle::IntegrationThrottle;
use crate::store::{Store, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Ok,
    /// Refused before calling the app.
    Unavailable,
    /// The app was called and answered with an error.
    Error,
}

/// Result of one field's search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub field: String,
    pub status: ResourceStatus,
    pub options: Vec<ResourceOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResourceResult {
    fn ok(field: &str, options: Vec<ResourceOption>) -> Self {
        Self {
            field: field.to_string(),
            status: ResourceStatus::Ok,
            options,
            message: None,
        }
    }

    fn unavailable(field: &str, message: String) -> Self {
        Self {
            field: field.to_string(),
            status: ResourceStatus::Unavailable,
            options: Vec::new(),
            message: Some(message),
        }
    }

    fn error(field: &str, message: String) -> Self {
        Self {
            field: field.to_string(),
            status: ResourceStatus::Error,
            options: Vec::new(),
            message: Some(message),
        }
    }
}

/// One field of a batch search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSearch {
    pub field: String,
    pub resource_key: String,
    #[serde(default)]
    pub query: String,
}

/// `POST /discovered/resources/search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSearchRequest {
    pub app_key: String,
    #[serde(default)]
    pub integration_id: Option<i64>,
    pub fields: Vec<FieldSearch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSearchResponse {
    pub results: Vec<ResourceResult>,
}

#[derive(Clone)]
pub struct ResourceResolver {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    clients: Arc<dyn ClientProvider>,
    throttle: IntegrationThrottle,
    timeout: Duration,
}

/// Client lookup outcome for a batch.
enum Access {
    Client(Option<Arc<dyn IntegrationClient>>),
    Refused(String),
}

impl ResourceResolver {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        clients: Arc<dyn ClientProvider>,
        throttle: IntegrationThrottle,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            clients,
            throttle,
            timeout,
        }
    }

    async fn access(&self, app_key: &str, integration_id: Option<i64>) -> StoreResult<Access> {
        let requires_auth = self
            .registry
            .app(app_key)
            .is_some_and(|app| app.requires_auth);

        let integration = match integration_id {
            Some(id) => self.store.get_integration(id).await?,
            None => None,
        };

        let integration = match integration {
            Some(i) if i.app_key != app_key => {
                return Ok(Access::Refused(format!(
                    "Integration {} belongs to '{}', not '{app_key}'",
                    i.id, i.app_key
                )))
            }
            Some(i) if i.is_active() => i,
            Some(i) if requires_auth => {
                return Ok(Access::Refused(format!(
                    "Integration {} is {}; reconnect it to load choices",
                    i.id,
                    i.state.as_str()
                )))
            }
            None if requires_auth => {
                return Ok(Access::Refused(format!(
                    "Connect an integration for '{app_key}' to load choices"
                )))
            }
            _ => return Ok(Access::Client(None)),
        };

        match self.clients.client(&integration).await {
            Ok(client) => Ok(Access::Client(Some(client))),
            Err(e) if requires_auth => Ok(Access::Refused(e.to_string())),
            Err(e) => {
                tracing::warn!(integration_id = integration.id, error = %e, "Integration client unavailable");
                Ok(Access::Client(None))
            }
        }
    }

    /// Search one resource.
    pub async fn search(
        &self,
        app_key: &str,
        resource_key: &str,
        integration_id: Option<i64>,
        query: &str,
    ) -> StoreResult<ResourceResult> {
        let request = ResourceSearchRequest {
            app_key: app_key.to_string(),
            integration_id,
            fields: vec![FieldSearch {
                field: resource_key.to_string(),
                resource_key: resource_key.to_string(),
                query: query.to_string(),
            }],
        };
        let mut response = self.search_batch(&request).await?;
        Ok(response.results.remove(0))
    }

    /// Search every field of `request`; each field gets its own result.
    pub async fn search_batch(
        &self,
        request: &ResourceSearchRequest,
    ) -> StoreResult<ResourceSearchResponse> {
        let access = self.access(&request.app_key, request.integration_id).await?;
        let client = match access {
            Access::Refused(message) => {
                tracing::info!(
                    app_key = %request.app_key,
                    integration_id = ?request.integration_id,
                    reason = %message,
                    "Resource search refused"
                );
                let results = request
                    .fields
                    .iter()
                    .map(|f| ResourceResult::unavailable(&f.field, message.clone()))
                    .collect();
                return Ok(ResourceSearchResponse { results });
            }
            Access::Client(client) => client,
        };

        let mut results = Vec::with_capacity(request.fields.len());
        for field in &request.fields {
            let Some(source) = self.registry.resource(&request.app_key, &field.resource_key) else {
                results.push(ResourceResult::error(
                    &field.field,
                    format!("Unknown resource '{}.{}'", request.app_key, field.resource_key),
                ));
                continue;
            };

            let timeout = self.timeout;
            let outcome = self
                .throttle
                .run(request.integration_id, async {
                    match tokio::time::timeout(timeout, source.search(&field.query, client.as_deref())).await {
                        Ok(result) => result,
                        Err(_) => Err(ActionError::Timeout(timeout.as_millis() as u64)),
                    }
                })
                .await;

            results.push(match outcome {
                Ok(options) => ResourceResult::ok(&field.field, options),
                Err(e) => {
                    tracing::warn!(
                        app_key = %request.app_key,
                        resource_key = %field.resource_key,
                        error = %e,
                        "Resource search failed"
                    );
                    ResourceResult::error(&field.field, e.to_string())
                }
            });
        }
        Ok(ResourceSearchResponse { results })
    }
}
