//! Generic authenticated JSON API.
//!
//! Everything goes through the integration's [`IntegrationClient`], so the
//! same app works for any service reachable with bearer, basic or API-key
//! credentials.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::client::{ApiRequest, HttpMethod, IntegrationClient};
use crate::error::ActionError;
use crate::registry::{Action, ActionOutput, AppInfo, Registry, ResourceOption, ResourceSource, Trigger};
use crate::schema::{FieldOption, FieldSchema, FieldType};

pub const APP: AppInfo = AppInfo {
    key: "rest",
    name: "REST API",
    requires_auth: true,
};

pub fn register(registry: &mut Registry) {
    registry.register_action(APP, RestRequest);
    registry.register_trigger(APP, RecordCreated);
    registry.register_resource(APP, RecordSearch);
}

fn require_client(client: Option<&dyn IntegrationClient>) -> Result<&dyn IntegrationClient, ActionError> {
    client.ok_or_else(|| ActionError::Auth("No integration connected".to_string()))
}

pub struct RestRequest;

#[async_trait]
impl Action for RestRequest {
    fn key(&self) -> &'static str {
        "request"
    }

    fn label(&self) -> &'static str {
        "Make API request"
    }

    fn requires_auth(&self) -> bool {
        true
    }

    fn props(&self) -> Vec<FieldSchema> {
        let methods = ["GET", "POST", "PUT", "PATCH", "DELETE"]
            .into_iter()
            .map(|m| FieldOption::new(m, m))
            .collect();
        vec![
            FieldSchema::new("method", "Method", FieldType::Select)
                .required()
                .with_options(methods),
            FieldSchema::text("path", "Path").required(),
            FieldSchema::text("record_id", "Record")
                .dynamic("records")
                .with_help("Appended to the path when set"),
            FieldSchema::new("body", "Body", FieldType::Json),
        ]
    }

    fn sample(&self) -> Value {
        json!({"id": "rec_42", "email": "jane@example.com", "created": true})
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        client: Option<&dyn IntegrationClient>,
    ) -> Result<ActionOutput, ActionError> {
        let client = require_client(client)?;
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .and_then(HttpMethod::parse)
            .ok_or_else(|| ActionError::Validation("Field 'method' is invalid".to_string()))?;
        let mut path = args
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(id) = args.get("record_id").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            path = format!("{}/{}", path.trim_end_matches('/'), id);
        }

        let mut request = ApiRequest::new(method, path);
        if let Some(body) = args.get("body").filter(|b| !b.is_null() && b.as_str() != Some("")) {
            request = request.with_body(body.clone());
        }

        let response = client.request(request).await?;
        let output = match &response.body {
            Value::Object(_) => response.body.clone(),
            other => json!({"data": other}),
        };
        Ok(ActionOutput::new(
            output,
            json!({"status": response.status, "body": response.body}),
        ))
    }
}

/// Newest record, offered as an exemplar for configuration.
pub struct RecordCreated;

#[async_trait]
impl Trigger for RecordCreated {
    fn key(&self) -> &'static str {
        "record_created"
    }

    fn label(&self) -> &'static str {
        "Record created"
    }

    fn requires_auth(&self) -> bool {
        true
    }

    fn props(&self) -> Vec<FieldSchema> {
        vec![FieldSchema::text("collection", "Collection").with_help("Defaults to records")]
    }

    fn sample(&self) -> Value {
        json!({"id": "rec_42", "email": "jane@example.com", "name": "Jane Doe"})
    }

    async fn test(
        &self,
        config: &Map<String, Value>,
        client: Option<&dyn IntegrationClient>,
    ) -> Result<Value, ActionError> {
        let client = require_client(client)?;
        let collection = config
            .get("collection")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("records");
        let response = client
            .request(ApiRequest::get(format!("/{collection}")).with_query("limit", "1"))
            .await?;
        Ok(records(&response.body)
            .first()
            .cloned()
            .unwrap_or_else(|| self.sample()))
    }
}

pub struct RecordSearch;

#[async_trait]
impl ResourceSource for RecordSearch {
    fn key(&self) -> &'static str {
        "records"
    }

    async fn search(
        &self,
        query: &str,
        client: Option<&dyn IntegrationClient>,
    ) -> Result<Vec<ResourceOption>, ActionError> {
        let client = require_client(client)?;
        let response = client
            .request(ApiRequest::get("/records").with_query("q", query))
            .await?;
        Ok(records(&response.body).iter().filter_map(to_option).collect())
    }
}

/// Accept either a bare array or `{"data": [...]}`.
fn records(body: &Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("data")
            .or_else(|| map.get("records"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn to_option(record: &Value) -> Option<ResourceOption> {
    let value = match record.get("id").or_else(|| record.get("value"))? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let label = ["name", "label", "email", "title"]
        .iter()
        .find_map(|k| record.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| value.clone());
    Some(ResourceOption { value, label })
}
