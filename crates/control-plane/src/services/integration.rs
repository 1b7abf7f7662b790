//! Integration store service: connections to third-party apps.

use funnelflow_actions::Registry;
use std::sync::Arc;

use crate::crypto::CredentialCipher;
use crate::db::models::{
    IntegrationCreateRequest, IntegrationResponse, IntegrationState, IntegrationTestResponse,
    NewIntegration,
};
use crate::engine::ClientProvider;
use crate::error::{AppError, AppResult};
use crate::store::Store;

#[derive(Clone)]
pub struct IntegrationService {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    cipher: CredentialCipher,
    clients: Arc<dyn ClientProvider>,
}

impl IntegrationService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        cipher: CredentialCipher,
        clients: Arc<dyn ClientProvider>,
    ) -> Self {
        Self {
            store,
            registry,
            cipher,
            clients,
        }
    }

    /// Store a new integration in state `created`. Credentials are
    /// encrypted before they reach the store.
    pub async fn create(&self, request: IntegrationCreateRequest) -> AppResult<IntegrationResponse> {
        if self.registry.app(&request.app_key).is_none() {
            return Err(AppError::Validation(format!(
                "Unknown app '{}'",
                request.app_key
            )));
        }
        if request.name.trim().is_empty() {
            return Err(AppError::Validation("Integration name is required".to_string()));
        }

        let credentials = match &request.credentials {
            Some(value) if !value.is_null() => self.cipher.encrypt_json(value)?,
            _ => Vec::new(),
        };

        let integration = self
            .store
            .create_integration(NewIntegration {
                tenant_id: request.tenant_id,
                app_key: request.app_key,
                name: request.name,
                credentials,
                config: request.config.unwrap_or_else(|| serde_json::json!({})),
            })
            .await?;

        tracing::info!(
            integration_id = integration.id,
            app_key = %integration.app_key,
            "Integration created"
        );
        Ok(integration.into())
    }

    pub async fn get(&self, id: i64) -> AppResult<IntegrationResponse> {
        self.store
            .get_integration(id)
            .await?
            .map(IntegrationResponse::from)
            .ok_or_else(|| AppError::NotFound(format!("Integration {id} not found")))
    }

    pub async fn list(&self, tenant_id: Option<&str>) -> AppResult<Vec<IntegrationResponse>> {
        let integrations = self.store.list_integrations(tenant_id).await?;
        Ok(integrations.into_iter().map(IntegrationResponse::from).collect())
    }

    pub async fn delete(&self, id: i64) -> AppResult<()> {
        if self.store.delete_integration(id).await? {
            tracing::info!(integration_id = id, "Integration deleted");
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Integration {id} not found")))
        }
    }

    /// Test the stored credentials. A successful test makes the
    /// integration `active`, a failed one puts it in `error`.
    pub async fn test(&self, id: i64) -> AppResult<IntegrationTestResponse> {
        let integration = self
            .store
            .get_integration(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Integration {id} not found")))?;

        let result = match self.clients.client(&integration).await {
            Ok(client) => client.test().await,
            Err(e) => funnelflow_actions::ConnectionTest::failed(e.to_string()),
        };

        let state = if result.success {
            IntegrationState::Active
        } else {
            IntegrationState::Error
        };
        let updated = self
            .store
            .set_integration_state(id, state, Some(result.message.clone()), true)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Integration {id} not found")))?;

        tracing::info!(
            integration_id = id,
            success = result.success,
            state = state.as_str(),
            "Integration tested"
        );

        Ok(IntegrationTestResponse {
            success: result.success,
            message: result.message,
            integration: updated.into(),
        })
    }

    /// Operator enable (`active`) or disable (`inactive`).
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> AppResult<IntegrationResponse> {
        let (state, message) = if enabled {
            (IntegrationState::Active, "Enabled by operator")
        } else {
            (IntegrationState::Inactive, "Disabled by operator")
        };
        let updated = self
            .store
            .set_integration_state(id, state, Some(message.to_string()), false)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Integration {id} not found")))?;
        tracing::info!(integration_id = id, state = state.as_str(), "Integration state changed");
        Ok(updated.into())
    }
}
