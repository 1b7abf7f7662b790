//! Data shaping helpers that call no third party.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::client::IntegrationClient;
use crate::error::ActionError;
use crate::registry::{Action, ActionOutput, AppInfo, Registry};
use crate::schema::{FieldSchema, FieldType};

pub const APP: AppInfo = AppInfo {
    key: "utility",
    name: "Utilities",
    requires_auth: false,
};

pub fn register(registry: &mut Registry) {
    registry.register_action(APP, Compose);
}

/// Emit the resolved `fields` object as the step output, so later steps can
/// reference a value built from several earlier ones.
pub struct Compose;

#[async_trait]
impl Action for Compose {
    fn key(&self) -> &'static str {
        "compose"
    }

    fn label(&self) -> &'static str {
        "Compose data"
    }

    fn requires_auth(&self) -> bool {
        false
    }

    fn props(&self) -> Vec<FieldSchema> {
        vec![FieldSchema::new("fields", "Fields", FieldType::Json).required()]
    }

    fn sample(&self) -> Value {
        json!({"full_name": "Jane Doe", "email": "jane@example.com"})
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        _client: Option<&dyn IntegrationClient>,
    ) -> Result<ActionOutput, ActionError> {
        match args.get("fields") {
            Some(fields @ Value::Object(_)) => Ok(ActionOutput::same(fields.clone())),
            Some(other) => Ok(ActionOutput::same(json!({ "value": other }))),
            None => Err(ActionError::Validation("Field 'fields' is required".to_string())),
        }
    }
}
