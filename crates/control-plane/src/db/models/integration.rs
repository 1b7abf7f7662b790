//! Integration model.
//!
//! Credentials are stored encrypted at rest; see [`crate::crypto`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection health of an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationState {
    #[default]
    Created,
    Active,
    Inactive,
    Error,
}

impl IntegrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationState::Created => "created",
            IntegrationState::Active => "active",
            IntegrationState::Inactive => "inactive",
            IntegrationState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(IntegrationState::Created),
            "active" => Some(IntegrationState::Active),
            "inactive" => Some(IntegrationState::Inactive),
            "error" => Some(IntegrationState::Error),
            _ => None,
        }
    }
}

/// A tenant's connection to a third-party app.
#[derive(Debug, Clone)]
pub struct Integration {
    pub id: i64,
    pub tenant_id: String,
    pub app_key: String,
    pub name: String,
    /// AES-GCM sealed JSON credentials; empty when none were given.
    pub credentials: Vec<u8>,
    /// Non-secret connection settings.
    pub config: Value,
    pub state: IntegrationState,
    pub last_message: Option<String>,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    pub fn is_active(&self) -> bool {
        self.state == IntegrationState::Active
    }
}

#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub tenant_id: String,
    pub app_key: String,
    pub name: String,
    pub credentials: Vec<u8>,
    pub config: Value,
}

fn default_tenant() -> String {
    "default".to_string()
}

/// Request to create an integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationCreateRequest {
    #[serde(default = "default_tenant")]
    pub tenant_id: String,

    pub app_key: String,

    pub name: String,

    /// Plaintext credentials (encrypted before storage)
    #[serde(default)]
    pub credentials: Option<Value>,

    #[serde(default)]
    pub config: Option<Value>,
}

/// Request to enable or disable an integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationStateRequest {
    pub enabled: bool,
}

/// Integration as returned by the API. Credentials never leave the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResponse {
    pub id: i64,
    pub tenant_id: String,
    pub app_key: String,
    pub name: String,
    pub config: Value,
    pub state: IntegrationState,
    pub has_credentials: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Integration> for IntegrationResponse {
    fn from(i: Integration) -> Self {
        Self {
            id: i.id,
            tenant_id: i.tenant_id,
            app_key: i.app_key,
            name: i.name,
            config: i.config,
            state: i.state,
            has_credentials: !i.credentials.is_empty(),
            last_message: i.last_message,
            last_tested_at: i.last_tested_at,
            created_at: i.created_at,
            updated_at: i.updated_at,
        }
    }
}

/// Result of `POST /integrations/{id}/test`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationTestResponse {
    pub success: bool,
    pub message: String,
    pub integration: IntegrationResponse,
}
