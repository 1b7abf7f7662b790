//! Sequence, trigger and action configuration models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inference::Schema;

/// An ordered chain of actions started by one or more triggers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sequence {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSequence {
    pub tenant_id: String,
    pub name: String,
    pub enabled: bool,
}

/// A configured trigger of a sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceTrigger {
    pub id: i64,
    pub sequence_id: i64,
    pub app_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<i64>,
    pub trigger_key: String,
    pub configuration: Value,
    /// `dot.path -> expected` filter on the event payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_output: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub sequence_id: i64,
    pub app_key: String,
    pub integration_id: Option<i64>,
    pub trigger_key: String,
    pub configuration: Value,
    pub conditions: Option<Value>,
}

/// A configured action at a 1-based position of a sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceAction {
    pub id: i64,
    pub sequence_id: i64,
    pub position: i32,
    pub name: String,
    pub app_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<i64>,
    pub action_key: String,
    pub configuration: Value,
    pub max_retries: i32,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_output: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SequenceAction {
    /// `app.action_key`, recorded as the step's node type.
    pub fn node_type(&self) -> String {
        format!("{}.{}", self.app_key, self.action_key)
    }
}

#[derive(Debug, Clone)]
pub struct NewAction {
    pub sequence_id: i64,
    /// Insert before the action currently at this position; append when unset.
    pub position: Option<i32>,
    pub name: String,
    pub app_key: String,
    pub integration_id: Option<i64>,
    pub action_key: String,
    pub configuration: Value,
    pub max_retries: i32,
    pub enabled: bool,
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceCreateRequest {
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceUpdateRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SequenceListQuery {
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCreateRequest {
    pub app_key: String,
    pub trigger_key: String,
    #[serde(default)]
    pub integration_id: Option<i64>,
    #[serde(default)]
    pub configuration: Option<Value>,
    #[serde(default)]
    pub conditions: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCreateRequest {
    pub app_key: String,
    pub action_key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<i32>,
    #[serde(default)]
    pub integration_id: Option<i64>,
    #[serde(default)]
    pub configuration: Option<Value>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMoveRequest {
    pub position: i32,
}

/// Sequence with its triggers and ordered actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDetail {
    #[serde(flatten)]
    pub sequence: Sequence,
    pub triggers: Vec<SequenceTrigger>,
    pub actions: Vec<SequenceAction>,
}

/// A template variable offered at some position of a sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateVariable {
    /// Full expression, e.g. `trigger.member.email` or `2.id`
    pub name: String,
    /// Inferred primitive type
    #[serde(rename = "type")]
    pub value_type: String,
    /// `trigger` or the source action's position
    pub source: String,
}

/// Result of `POST /sequences/{id}/triggers/{id}/test`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerTestResponse {
    pub trigger_id: i64,
    pub sample: Value,
    /// Inferred `dot.path -> type` of the sample
    pub schema: Schema,
    pub variables: Vec<TemplateVariable>,
}

/// Variables available to the action at `position`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionVariables {
    pub position: i32,
    pub action_id: i64,
    pub variables: Vec<TemplateVariable>,
}
