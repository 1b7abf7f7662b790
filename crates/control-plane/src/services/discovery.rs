//! Discovery of registered apps and configuration-time resource search.

use funnelflow_actions::{ActionDescriptor, AppDescriptor, Registry, TriggerDescriptor};
use serde::Deserialize;
use std::sync::Arc;

use crate::engine::{ResourceResolver, ResourceSearchRequest, ResourceSearchResponse};
use crate::error::{AppError, AppResult};

/// Query of `GET /discovered/triggers` and `GET /discovered/actions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryQuery {
    pub app_key: Option<String>,
}

#[derive(Clone)]
pub struct DiscoveryService {
    registry: Arc<Registry>,
    resources: ResourceResolver,
}

impl DiscoveryService {
    pub fn new(registry: Arc<Registry>, resources: ResourceResolver) -> Self {
        Self {
            registry,
            resources,
        }
    }

    pub fn apps(&self) -> Vec<AppDescriptor> {
        self.registry.apps()
    }

    pub fn triggers(&self, query: &DiscoveryQuery) -> Vec<TriggerDescriptor> {
        self.registry
            .triggers()
            .into_iter()
            .filter(|t| query.app_key.as_deref().map_or(true, |app| t.app_key == app))
            .collect()
    }

    pub fn actions(&self, query: &DiscoveryQuery) -> Vec<ActionDescriptor> {
        self.registry
            .actions()
            .into_iter()
            .filter(|a| query.app_key.as_deref().map_or(true, |app| a.app_key == app))
            .collect()
    }

    pub async fn search(&self, request: ResourceSearchRequest) -> AppResult<ResourceSearchResponse> {
        if self.registry.app(&request.app_key).is_none() {
            return Err(AppError::NotFound(format!("App '{}' not found", request.app_key)));
        }
        if request.fields.is_empty() {
            return Err(AppError::Validation("No fields to search".to_string()));
        }
        Ok(self.resources.search_batch(&request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CredentialCipher;
    use crate::engine::{HttpClientProvider, IntegrationThrottle};
    use crate::store::MemoryStore;
    use funnelflow_actions::apps::default_registry;
    use std::time::Duration;

    fn service() -> DiscoveryService {
        let registry = Arc::new(default_registry());
        let cipher = CredentialCipher::from_bytes(&CredentialCipher::generate_key()).unwrap();
        let resources = ResourceResolver::new(
            Arc::new(MemoryStore::new()),
            registry.clone(),
            Arc::new(HttpClientProvider::new(cipher)),
            IntegrationThrottle::new(1, Duration::ZERO),
            Duration::from_secs(1),
        );
        DiscoveryService::new(registry, resources)
    }

    #[test]
    fn test_listing_filters_by_app() {
        let service = service();
        let all = service.triggers(&DiscoveryQuery::default());
        assert!(all.iter().any(|t| t.key == "purchase_completed"));
        assert!(all.iter().any(|t| t.key == "record_created"));

        let checkout = service.triggers(&DiscoveryQuery {
            app_key: Some("checkout".into()),
        });
        assert!(checkout.iter().all(|t| t.app_key == "checkout"));
        assert_eq!(checkout.len(), 2);

        let actions = service.actions(&DiscoveryQuery {
            app_key: Some("utility".into()),
        });
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].key, "compose");
    }

    #[tokio::test]
    async fn test_search_validates_request() {
        let service = service();
        let unknown = service
            .search(ResourceSearchRequest {
                app_key: "nope".into(),
                integration_id: None,
                fields: Vec::new(),
            })
            .await;
        assert!(matches!(unknown, Err(AppError::NotFound(_))));

        let empty = service
            .search(ResourceSearchRequest {
                app_key: "rest".into(),
                integration_id: None,
                fields: Vec::new(),
            })
            .await;
        assert!(matches!(empty, Err(AppError::Validation(_))));
    }
}
