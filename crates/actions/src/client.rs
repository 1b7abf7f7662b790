//! Integration clients.
//!
//! Actions, trigger tests and resource searches never look up credentials
//! themselves: the caller resolves an [`IntegrationClient`] for the
//! integration and passes it in.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::ActionError;

/// HTTP method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
}

impl HttpMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::GET),
            "POST" => Some(HttpMethod::POST),
            "PUT" => Some(HttpMethod::PUT),
            "PATCH" => Some(HttpMethod::PATCH),
            "DELETE" => Some(HttpMethod::DELETE),
            _ => None,
        }
    }
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::GET => Method::GET,
            HttpMethod::POST => Method::POST,
            HttpMethod::PUT => Method::PUT,
            HttpMethod::PATCH => Method::PATCH,
            HttpMethod::DELETE => Method::DELETE,
        }
    }
}

/// A request relative to the integration's base URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::POST, path).with_body(body)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Successful (2xx) answer from a third-party API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// Outcome of a credential test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
}

impl ConnectionTest {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Authenticated access to one third-party account.
#[async_trait]
pub trait IntegrationClient: Send + Sync {
    fn integration_id(&self) -> i64;

    /// Perform a request. Non-2xx answers are errors: 401/403 map to
    /// [`ActionError::Auth`], everything else to [`ActionError::ExternalApi`].
    async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ActionError>;

    /// Check that the stored credentials are accepted.
    async fn test(&self) -> ConnectionTest;
}

/// Decrypted integration credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthCredentials {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        value: String,
    },
    #[default]
    None,
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

impl AuthCredentials {
    /// Apply credentials to a request builder.
    pub fn apply_to_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            AuthCredentials::Bearer { token } => request.bearer_auth(token),
            AuthCredentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthCredentials::ApiKey { header, value } => {
                request.header(header.as_str(), value.as_str())
            }
            AuthCredentials::None => request,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AuthCredentials::Bearer { token } => token.is_empty(),
            AuthCredentials::Basic { username, .. } => username.is_empty(),
            AuthCredentials::ApiKey { value, .. } => value.is_empty(),
            AuthCredentials::None => true,
        }
    }
}

/// Non-secret connection settings stored with an integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub base_url: String,

    /// Path requested by a credential test (default: `/`).
    #[serde(default = "default_test_path")]
    pub test_path: String,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_test_path() -> String {
    "/".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

/// [`IntegrationClient`] speaking JSON over HTTP with reqwest.
pub struct HttpIntegrationClient {
    integration_id: i64,
    settings: ConnectionSettings,
    credentials: AuthCredentials,
    client: reqwest::Client,
}

impl HttpIntegrationClient {
    pub fn new(
        integration_id: i64,
        settings: ConnectionSettings,
        credentials: AuthCredentials,
    ) -> Result<Self, ActionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| ActionError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            integration_id,
            settings,
            credentials,
            client,
        })
    }

    /// Build from the integration's stored config and decrypted credentials.
    pub fn from_json(
        integration_id: i64,
        config: &Value,
        credentials: &Value,
    ) -> Result<Self, ActionError> {
        let settings: ConnectionSettings = serde_json::from_value(config.clone())
            .map_err(|e| ActionError::Validation(format!("Invalid connection settings: {e}")))?;
        let credentials: AuthCredentials = if credentials.is_null() {
            AuthCredentials::None
        } else {
            serde_json::from_value(credentials.clone())
                .map_err(|e| ActionError::Validation(format!("Invalid credentials: {e}")))?
        };
        Self::new(integration_id, settings, credentials)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl IntegrationClient for HttpIntegrationClient {
    fn integration_id(&self) -> i64 {
        self.integration_id
    }

    async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ActionError> {
        let url = self.url(&request.path);
        tracing::debug!(
            integration_id = self.integration_id,
            method = ?request.method,
            url = %url,
            "Calling integration API"
        );

        let mut builder = self.client.request(request.method.into(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        builder = self.credentials.apply_to_request(builder);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ActionError::Timeout(self.settings.timeout_seconds * 1000)
            } else {
                ActionError::from(e)
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        classify_response(status, body)
    }

    async fn test(&self) -> ConnectionTest {
        if self.credentials.is_empty() {
            return ConnectionTest::failed("No credentials configured");
        }
        match self.request(ApiRequest::get(self.settings.test_path.clone())).await {
            Ok(response) => ConnectionTest::ok(format!("Connected (HTTP {})", response.status)),
            Err(ActionError::Auth(message)) => {
                ConnectionTest::failed(format!("Credentials rejected: {message}"))
            }
            Err(e) => ConnectionTest::failed(e.to_string()),
        }
    }
}

/// Map an HTTP status and body to the action error taxonomy.
pub fn classify_response(status: u16, body: Value) -> Result<ApiResponse, ActionError> {
    match status {
        200..=299 => Ok(ApiResponse { status, body }),
        401 | 403 => Err(ActionError::Auth(format!(
            "HTTP {status}: {}",
            error_message(&body)
        ))),
        _ => Err(ActionError::external(
            Some(status),
            format!("HTTP {status}: {}", error_message(&body)),
        )),
    }
}

fn error_message(body: &Value) -> String {
    for key in ["message", "error", "detail"] {
        if let Some(Value::String(s)) = body.get(key) {
            return s.clone();
        }
    }
    match body {
        Value::String(s) if !s.is_empty() => s.chars().take(200).collect(),
        Value::Null => "no response body".to_string(),
        other => other.to_string().chars().take(200).collect(),
    }
}
