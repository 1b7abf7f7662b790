//! Resolution of integrations to API clients.
//!
//! The executor and the resource resolver never look clients up on their
//! own; they are handed one by a [`ClientProvider`].

use async_trait::async_trait;
use funnelflow_actions::{ActionError, HttpIntegrationClient, IntegrationClient};
use serde_json::Value;
use std::sync::Arc;

use crate::crypto::CredentialCipher;
use crate::db::models::Integration;

#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client(&self, integration: &Integration)
        -> Result<Arc<dyn IntegrationClient>, ActionError>;
}

/// Builds an HTTP client from the integration's stored config and its
/// decrypted credentials.
#[derive(Clone)]
pub struct HttpClientProvider {
    cipher: CredentialCipher,
}

impl HttpClientProvider {
    pub fn new(cipher: CredentialCipher) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl ClientProvider for HttpClientProvider {
    async fn client(
        &self,
        integration: &Integration,
    ) -> Result<Arc<dyn IntegrationClient>, ActionError> {
        let credentials = if integration.credentials.is_empty() {
            Value::Null
        } else {
            self.cipher
                .decrypt_json(&integration.credentials)
                .map_err(|e| ActionError::Auth(format!("Stored credentials unreadable: {e}")))?
        };
        let client = HttpIntegrationClient::from_json(integration.id, &integration.config, &credentials)?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::IntegrationState;
    use chrono::Utc;
    use serde_json::json;

    fn integration(cipher: &CredentialCipher, credentials: serde_json::Value) -> Integration {
        Integration {
            id: 5,
            tenant_id: "default".into(),
            app_key: "rest".into(),
            name: "CRM".into(),
            credentials: cipher.encrypt_json(&credentials).unwrap(),
            config: json!({"base_url": "https://crm.example.com/api"}),
            state: IntegrationState::Active,
            last_message: None,
            last_tested_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_builds_client_from_encrypted_credentials() {
        let cipher = CredentialCipher::from_bytes(&CredentialCipher::generate_key()).unwrap();
        let provider = HttpClientProvider::new(cipher.clone());
        let client = provider
            .client(&integration(&cipher, json!({"type": "bearer", "token": "t0k"})))
            .await
            .unwrap();
        assert_eq!(client.integration_id(), 5);
    }

    #[tokio::test]
    async fn test_no_credentials() {
        let cipher = CredentialCipher::from_bytes(&CredentialCipher::generate_key()).unwrap();
        let provider = HttpClientProvider::new(cipher.clone());
        let mut integration = integration(&cipher, json!(null));
        integration.credentials = Vec::new();
        assert!(provider.client(&integration).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_key_is_auth_error() {
        let cipher = CredentialCipher::from_bytes(&CredentialCipher::generate_key()).unwrap();
        let other = CredentialCipher::from_bytes(&CredentialCipher::generate_key()).unwrap();
        let provider = HttpClientProvider::new(other);
        let result = provider
            .client(&integration(&cipher, json!({"type": "bearer", "token": "t0k"})))
            .await;
        assert!(matches!(result, Err(ActionError::Auth(_))));
    }
}
