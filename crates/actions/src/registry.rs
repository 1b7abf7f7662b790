//! App registry and dispatch.
//!
//! Every action, trigger and resource source is registered explicitly under
//! its app; lookups are by `(app_key, key)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::IntegrationClient;
use crate::error::ActionError;
use crate::schema::FieldSchema;

/// Output of one action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    /// Data exposed to later steps as `{{<position>.path}}`.
    pub output: Value,
    /// Third-party response, kept verbatim.
    pub raw_response: Value,
}

impl ActionOutput {
    pub fn new(output: Value, raw_response: Value) -> Self {
        Self {
            output,
            raw_response,
        }
    }

    /// Output that is also the raw response.
    pub fn same(output: Value) -> Self {
        Self {
            raw_response: output.clone(),
            output,
        }
    }
}

/// A choice offered for a dynamic field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOption {
    pub value: String,
    pub label: String,
}

/// An operation performed against a third-party app.
#[async_trait]
pub trait Action: Send + Sync {
    fn key(&self) -> &'static str;

    fn label(&self) -> &'static str;

    fn requires_auth(&self) -> bool;

    /// Declared configuration schema.
    fn props(&self) -> Vec<FieldSchema>;

    /// Representative output, used for variable discovery.
    fn sample(&self) -> Value;

    /// Run with resolved and coerced arguments.
    async fn execute(
        &self,
        args: &Map<String, Value>,
        client: Option<&dyn IntegrationClient>,
    ) -> Result<ActionOutput, ActionError>;
}

/// A kind of external event that can start a sequence.
#[async_trait]
pub trait Trigger: Send + Sync {
    fn key(&self) -> &'static str;

    fn label(&self) -> &'static str;

    fn requires_auth(&self) -> bool;

    fn props(&self) -> Vec<FieldSchema>;

    fn sample(&self) -> Value;

    /// Whether an event payload is relevant for this configuration.
    fn matches(&self, _config: &Map<String, Value>, _event_data: &Value) -> bool {
        true
    }

    /// Produce an exemplar payload for a configured trigger.
    async fn test(
        &self,
        _config: &Map<String, Value>,
        _client: Option<&dyn IntegrationClient>,
    ) -> Result<Value, ActionError> {
        Ok(self.sample())
    }
}

/// Configuration-time search for dynamic field choices.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    fn key(&self) -> &'static str;

    async fn search(
        &self,
        query: &str,
        client: Option<&dyn IntegrationClient>,
    ) -> Result<Vec<ResourceOption>, ActionError>;
}

/// Static app metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppInfo {
    pub key: &'static str,
    pub name: &'static str,
    pub requires_auth: bool,
}

#[derive(Default)]
struct AppEntry {
    info: Option<AppInfo>,
    actions: BTreeMap<String, Arc<dyn Action>>,
    triggers: BTreeMap<String, Arc<dyn Trigger>>,
    resources: BTreeMap<String, Arc<dyn ResourceSource>>,
}

/// Listing entry for a registered action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub app_key: String,
    pub app_name: String,
    pub key: String,
    pub label: String,
    pub requires_auth: bool,
    pub props: Vec<FieldSchema>,
    pub sample: Value,
}

/// Listing entry for a registered trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    pub app_key: String,
    pub app_name: String,
    pub key: String,
    pub label: String,
    pub requires_auth: bool,
    pub props: Vec<FieldSchema>,
    pub sample: Value,
}

/// Listing entry for an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub key: String,
    pub name: String,
    pub requires_auth: bool,
    pub triggers: Vec<String>,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

/// Registry of available apps.
#[derive(Default)]
pub struct Registry {
    apps: BTreeMap<&'static str, AppEntry>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, app: AppInfo) -> &mut AppEntry {
        let entry = self.apps.entry(app.key).or_default();
        entry.info = Some(app);
        entry
    }

    pub fn register_action<A: Action + 'static>(&mut self, app: AppInfo, action: A) {
        let key = action.key().to_string();
        self.entry(app).actions.insert(key, Arc::new(action));
    }

    pub fn register_trigger<T: Trigger + 'static>(&mut self, app: AppInfo, trigger: T) {
        let key = trigger.key().to_string();
        self.entry(app).triggers.insert(key, Arc::new(trigger));
    }

    pub fn register_resource<R: ResourceSource + 'static>(&mut self, app: AppInfo, resource: R) {
        let key = resource.key().to_string();
        self.entry(app).resources.insert(key, Arc::new(resource));
    }

    pub fn app(&self, app_key: &str) -> Option<AppInfo> {
        self.apps.get(app_key).and_then(|e| e.info)
    }

    pub fn action(&self, app_key: &str, key: &str) -> Option<Arc<dyn Action>> {
        self.apps.get(app_key)?.actions.get(key).cloned()
    }

    pub fn trigger(&self, app_key: &str, key: &str) -> Option<Arc<dyn Trigger>> {
        self.apps.get(app_key)?.triggers.get(key).cloned()
    }

    pub fn resource(&self, app_key: &str, key: &str) -> Option<Arc<dyn ResourceSource>> {
        self.apps.get(app_key)?.resources.get(key).cloned()
    }

    /// Look up an action or fail with [`ActionError::NotFound`].
    pub fn require_action(&self, app_key: &str, key: &str) -> Result<Arc<dyn Action>, ActionError> {
        self.action(app_key, key)
            .ok_or_else(|| ActionError::NotFound(format!("action {app_key}.{key}")))
    }

    pub fn require_trigger(
        &self,
        app_key: &str,
        key: &str,
    ) -> Result<Arc<dyn Trigger>, ActionError> {
        self.trigger(app_key, key)
            .ok_or_else(|| ActionError::NotFound(format!("trigger {app_key}.{key}")))
    }

    pub fn apps(&self) -> Vec<AppDescriptor> {
        self.apps
            .iter()
            .filter_map(|(key, entry)| {
                let info = entry.info?;
                Some(AppDescriptor {
                    key: key.to_string(),
                    name: info.name.to_string(),
                    requires_auth: info.requires_auth,
                    triggers: entry.triggers.keys().cloned().collect(),
                    actions: entry.actions.keys().cloned().collect(),
                    resources: entry.resources.keys().cloned().collect(),
                })
            })
            .collect()
    }

    pub fn actions(&self) -> Vec<ActionDescriptor> {
        let mut out = Vec::new();
        for entry in self.apps.values() {
            let Some(info) = entry.info else { continue };
            for action in entry.actions.values() {
                out.push(ActionDescriptor {
                    app_key: info.key.to_string(),
                    app_name: info.name.to_string(),
                    key: action.key().to_string(),
                    label: action.label().to_string(),
                    requires_auth: action.requires_auth(),
                    props: action.props(),
                    sample: action.sample(),
                });
            }
        }
        out
    }

    pub fn triggers(&self) -> Vec<TriggerDescriptor> {
        let mut out = Vec::new();
        for entry in self.apps.values() {
            let Some(info) = entry.info else { continue };
            for trigger in entry.triggers.values() {
                out.push(TriggerDescriptor {
                    app_key: info.key.to_string(),
                    app_name: info.name.to_string(),
                    key: trigger.key().to_string(),
                    label: trigger.label().to_string(),
                    requires_auth: trigger.requires_auth(),
                    props: trigger.props(),
                    sample: trigger.sample(),
                });
            }
        }
        out
    }
}
