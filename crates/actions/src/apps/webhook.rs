//! Outgoing webhooks.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::client::{classify_response, HttpMethod, IntegrationClient};
use crate::error::ActionError;
use crate::registry::{Action, ActionOutput, AppInfo, Registry};
use crate::schema::{FieldOption, FieldSchema, FieldType};

pub const APP: AppInfo = AppInfo {
    key: "webhook",
    name: "Webhook",
    requires_auth: false,
};

pub fn register(registry: &mut Registry) {
    registry.register_action(APP, SendWebhook::new());
}

/// POST (or PUT) a JSON payload to an arbitrary URL.
pub struct SendWebhook {
    client: reqwest::Client,
}

impl SendWebhook {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for SendWebhook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for SendWebhook {
    fn key(&self) -> &'static str {
        "send"
    }

    fn label(&self) -> &'static str {
        "Send webhook"
    }

    fn requires_auth(&self) -> bool {
        false
    }

    fn props(&self) -> Vec<FieldSchema> {
        vec![
            FieldSchema::new("url", "URL", FieldType::Url).required(),
            FieldSchema::new("method", "Method", FieldType::Select).with_options(vec![
                FieldOption::new("POST", "POST"),
                FieldOption::new("PUT", "PUT"),
            ]),
            FieldSchema::new("payload", "Payload", FieldType::Json),
        ]
    }

    fn sample(&self) -> Value {
        json!({"status_code": 200, "body": {"received": true}})
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        _client: Option<&dyn IntegrationClient>,
    ) -> Result<ActionOutput, ActionError> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ActionError::Validation("Field 'url' is required".to_string()))?;
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .and_then(HttpMethod::parse)
            .unwrap_or(HttpMethod::POST);
        let payload = args.get("payload").cloned().unwrap_or_else(|| json!({}));

        tracing::debug!(url = %url, method = ?method, "Sending webhook");

        let response = self
            .client
            .request(method.into(), url)
            .json(&payload)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        let response = classify_response(status, body)?;
        let output = json!({"status_code": response.status, "body": response.body});
        Ok(ActionOutput::same(output))
    }
}
