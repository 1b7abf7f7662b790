//! Declared configuration schema for actions and triggers.
//!
//! A configuration is first validated into typed [`ConfigValue`]s (string
//! fields may still hold `{{...}}` templates at that point), then resolved
//! by the engine and finally coerced back to the declared field types with
//! [`FieldSchema::coerce`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::ActionError;

/// Field type as declared by an action or trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Textarea,
    Email,
    Url,
    Number,
    Boolean,
    Select,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOption {
    pub value: String,
    pub label: String,
}

impl FieldOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// One configurable property of an action or trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub multiple: bool,
    /// Resource key searched through the integration to offer choices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FieldOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl FieldSchema {
    pub fn new(key: impl Into<String>, label: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            field_type,
            required: false,
            multiple: false,
            dynamic: None,
            options: Vec::new(),
            help: None,
        }
    }

    pub fn text(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(key, label, FieldType::Text)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn dynamic(mut self, resource_key: impl Into<String>) -> Self {
        self.dynamic = Some(resource_key.into());
        self
    }

    pub fn with_options(mut self, options: Vec<FieldOption>) -> Self {
        self.options = options;
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Value used for an optional field that is absent or resolved to nothing.
    pub fn empty_value(&self) -> Value {
        if self.multiple {
            Value::Array(Vec::new())
        } else {
            Value::String(String::new())
        }
    }

    /// Validate one raw configuration value into its typed form.
    pub fn validate(&self, raw: &Value) -> Result<ConfigValue, ActionError> {
        if self.multiple {
            let items = match raw {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let mut values = Vec::with_capacity(items.len());
            for item in &items {
                match item {
                    Value::String(s) => values.push(s.clone()),
                    Value::Number(n) => values.push(n.to_string()),
                    Value::Bool(b) => values.push(b.to_string()),
                    _ => {
                        return Err(self.invalid("expected a list of text values"));
                    }
                }
            }
            return Ok(ConfigValue::Multiple(values));
        }

        match (self.field_type, raw) {
            (FieldType::Json, value) => Ok(ConfigValue::Json(value.clone())),
            (FieldType::Number, Value::Number(n)) => n
                .as_f64()
                .map(ConfigValue::Number)
                .ok_or_else(|| self.invalid("number out of range")),
            (FieldType::Boolean, Value::Bool(b)) => Ok(ConfigValue::Bool(*b)),
            (FieldType::Select, Value::String(s)) => {
                if !has_template(s) && !self.options.is_empty() && !self.allows_option(s) {
                    return Err(self.invalid(&format!("'{s}' is not one of the allowed options")));
                }
                Ok(ConfigValue::Text(s.clone()))
            }
            (_, Value::String(s)) => Ok(ConfigValue::Text(s.clone())),
            (FieldType::Text | FieldType::Textarea, Value::Number(n)) => {
                Ok(ConfigValue::Text(n.to_string()))
            }
            (FieldType::Text | FieldType::Textarea, Value::Bool(b)) => {
                Ok(ConfigValue::Text(b.to_string()))
            }
            (field_type, other) => Err(self.invalid(&format!(
                "expected {:?}, got {}",
                field_type,
                json_type_name(other)
            ))),
        }
    }

    /// Coerce a resolved value to the declared type.
    pub fn coerce(&self, value: Value) -> Result<Value, ActionError> {
        if self.multiple {
            let items = match value {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            let coerced = items
                .into_iter()
                .map(|item| self.coerce_scalar(item))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Value::Array(coerced));
        }
        self.coerce_scalar(value)
    }

    fn coerce_scalar(&self, value: Value) -> Result<Value, ActionError> {
        match self.field_type {
            FieldType::Text | FieldType::Textarea => Ok(match value {
                Value::String(s) => Value::String(s),
                Value::Null => Value::String(String::new()),
                other => Value::String(other.to_string()),
            }),
            FieldType::Email => {
                let s = value_to_text(&value);
                if !s.is_empty() && !is_email(&s) {
                    return Err(self.invalid(&format!("'{s}' is not a valid email address")));
                }
                Ok(Value::String(s))
            }
            FieldType::Url => {
                let s = value_to_text(&value);
                if !s.is_empty() && !(s.starts_with("http://") || s.starts_with("https://")) {
                    return Err(self.invalid(&format!("'{s}' is not an http(s) URL")));
                }
                Ok(Value::String(s))
            }
            FieldType::Number => match value {
                Value::Number(n) => Ok(Value::Number(n)),
                Value::String(s) if s.trim().is_empty() && !self.required => Ok(Value::Null),
                Value::String(s) => parse_number(s.trim())
                    .ok_or_else(|| self.invalid(&format!("'{s}' is not a number"))),
                other => Err(self.invalid(&format!("expected number, got {}", json_type_name(&other)))),
            },
            FieldType::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" | "" => Ok(Value::Bool(false)),
                    _ => Err(self.invalid(&format!("'{s}' is not a boolean"))),
                },
                Value::Number(n) => Ok(Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0)),
                Value::Null => Ok(Value::Bool(false)),
                other => Err(self.invalid(&format!("expected boolean, got {}", json_type_name(&other)))),
            },
            FieldType::Select => {
                let s = value_to_text(&value);
                if !self.options.is_empty() && !self.allows_option(&s) {
                    return Err(self.invalid(&format!("'{s}' is not one of the allowed options")));
                }
                Ok(Value::String(s))
            }
            FieldType::Json => Ok(match value {
                Value::String(s) => match serde_json::from_str::<Value>(&s) {
                    Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
                    _ => Value::String(s),
                },
                other => other,
            }),
        }
    }

    fn allows_option(&self, value: &str) -> bool {
        self.options.iter().any(|o| o.value == value)
    }

    fn invalid(&self, reason: &str) -> ActionError {
        ActionError::Validation(format!("Field '{}': {}", self.key, reason))
    }
}

/// A configuration value after schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    Text(String),
    Multiple(Vec<String>),
    Number(f64),
    Bool(bool),
    Json(Value),
}

impl ConfigValue {
    /// Whether any part of the value contains a template expression.
    pub fn has_template(&self) -> bool {
        match self {
            ConfigValue::Text(s) => has_template(s),
            ConfigValue::Multiple(items) => items.iter().any(|s| has_template(s)),
            ConfigValue::Json(v) => json_has_template(v),
            ConfigValue::Number(_) | ConfigValue::Bool(_) => false,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ConfigValue::Text(s) => Value::String(s.clone()),
            ConfigValue::Multiple(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            ConfigValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ConfigValue::Bool(b) => Value::Bool(*b),
            ConfigValue::Json(v) => v.clone(),
        }
    }
}

/// Validated configuration, keyed by field.
pub type Configuration = BTreeMap<String, ConfigValue>;

/// Validate a raw configuration object against a declared schema.
///
/// Unknown keys are rejected; absent optional fields are left out.
pub fn validate_configuration(
    schema: &[FieldSchema],
    raw: &Value,
) -> Result<Configuration, ActionError> {
    let empty = Map::new();
    let object = match raw {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(ActionError::Validation(format!(
                "Configuration must be an object, got {}",
                json_type_name(other)
            )))
        }
    };

    if let Some(unknown) = object.keys().find(|k| !schema.iter().any(|f| &f.key == *k)) {
        return Err(ActionError::Validation(format!("Unknown field '{unknown}'")));
    }

    let mut config = Configuration::new();
    for field in schema {
        match object.get(&field.key) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(ActionError::Validation(format!(
                        "Field '{}' is required",
                        field.key
                    )));
                }
            }
            Some(Value::String(s)) if s.is_empty() => {
                if field.required {
                    return Err(ActionError::Validation(format!(
                        "Field '{}' is required",
                        field.key
                    )));
                }
            }
            Some(raw) => {
                config.insert(field.key.clone(), field.validate(raw)?);
            }
        }
    }
    Ok(config)
}

pub fn has_template(s: &str) -> bool {
    s.contains("{{")
}

fn json_has_template(value: &Value) -> bool {
    match value {
        Value::String(s) => has_template(s),
        Value::Array(items) => items.iter().any(json_has_template),
        Value::Object(map) => map.values().any(json_has_template),
        _ => false,
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

fn is_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !s.contains(' '),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Vec<FieldSchema> {
        vec![
            FieldSchema::new("email", "Email", FieldType::Email).required(),
            FieldSchema::new("amount", "Amount", FieldType::Number),
            FieldSchema::new("tags", "Tags", FieldType::Text).multiple(),
            FieldSchema::new("mode", "Mode", FieldType::Select).with_options(vec![
                FieldOption::new("fast", "Fast"),
                FieldOption::new("slow", "Slow"),
            ]),
        ]
    }

    #[test]
    fn test_validate_configuration_typed() {
        let config = validate_configuration(
            &schema(),
            &json!({"email": "{{trigger.email}}", "amount": 12, "tags": "vip"}),
        )
        .unwrap();
        assert_eq!(config["email"], ConfigValue::Text("{{trigger.email}}".into()));
        assert_eq!(config["amount"], ConfigValue::Number(12.0));
        assert_eq!(config["tags"], ConfigValue::Multiple(vec!["vip".into()]));
        assert!(!config.contains_key("mode"));
        assert!(config["email"].has_template());
    }

    #[test]
    fn test_validate_configuration_required() {
        let err = validate_configuration(&schema(), &json!({"amount": 1})).unwrap_err();
        assert!(matches!(err, ActionError::Validation(ref m) if m.contains("'email' is required")));

        let err = validate_configuration(&schema(), &json!({"email": ""})).unwrap_err();
        assert!(matches!(err, ActionError::Validation(_)));
    }

    #[test]
    fn test_validate_configuration_rejects_unknown_and_wrong_type() {
        let err =
            validate_configuration(&schema(), &json!({"email": "a@b.io", "nope": 1})).unwrap_err();
        assert!(err.to_string().contains("Unknown field 'nope'"));

        let err =
            validate_configuration(&schema(), &json!({"email": "a@b.io", "amount": [1]})).unwrap_err();
        assert!(err.to_string().contains("Field 'amount'"));

        let err =
            validate_configuration(&schema(), &json!({"email": "a@b.io", "mode": "medium"})).unwrap_err();
        assert!(err.to_string().contains("allowed options"));
    }

    #[test]
    fn test_coerce_values() {
        let fields = schema();
        assert_eq!(fields[1].coerce(json!("42")).unwrap(), json!(42));
        assert_eq!(fields[1].coerce(json!("4.5")).unwrap(), json!(4.5));
        assert!(fields[1].coerce(json!("abc")).is_err());
        assert!(fields[0].coerce(json!("not-an-email")).is_err());
        assert_eq!(fields[0].coerce(json!("jane@example.com")).unwrap(), json!("jane@example.com"));
        assert_eq!(fields[2].coerce(json!(["a", 1])).unwrap(), json!(["a", "1"]));

        let flag = FieldSchema::new("flag", "Flag", FieldType::Boolean);
        assert_eq!(flag.coerce(json!("yes")).unwrap(), json!(true));

        let payload = FieldSchema::new("payload", "Payload", FieldType::Json);
        assert_eq!(payload.coerce(json!("{\"a\":1}")).unwrap(), json!({"a": 1}));
        assert_eq!(payload.coerce(json!("plain")).unwrap(), json!("plain"));
    }

    #[test]
    fn test_field_schema_serialization() {
        let field = FieldSchema::text("contact", "Contact").required().dynamic("records");
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["dynamic"], "records");
        assert!(json.get("options").is_none());
    }
}
