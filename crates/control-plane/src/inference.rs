//! Schema inference over JSON payloads.
//!
//! Turns an exemplar payload (a trigger sample, an action's last output)
//! into the flat `dot.path -> type` map that the configuration editor offers
//! as template variables.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::models::TemplateVariable;

pub const DEFAULT_MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    String,
    Number,
    Boolean,
    Null,
    Array,
    Object,
}

impl PrimitiveType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => PrimitiveType::String,
            Value::Number(_) => PrimitiveType::Number,
            Value::Bool(_) => PrimitiveType::Boolean,
            Value::Null => PrimitiveType::Null,
            Value::Array(_) => PrimitiveType::Array,
            Value::Object(_) => PrimitiveType::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveType::String => "string",
            PrimitiveType::Number => "number",
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Null => "null",
            PrimitiveType::Array => "array",
            PrimitiveType::Object => "object",
        }
    }
}

pub type Schema = BTreeMap<String, PrimitiveType>;

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}

/// Infer the leaf schema of `payload`.
///
/// Homogeneous arrays are described under `path.0` by merging the keys of
/// every element; mixed arrays list every element. Empty containers and containers below
/// the depth limit are reported as `array`/`object`. A primitive payload is
/// reported under the empty path.
pub fn infer(payload: &Value) -> Schema {
    infer_with_depth(payload, DEFAULT_MAX_DEPTH)
}

pub fn infer_with_depth(payload: &Value, max_depth: usize) -> Schema {
    let mut schema = Schema::new();
    infer_into(payload, "", 0, max_depth, &mut schema);
    schema
}

fn infer_into(value: &Value, path: &str, depth: usize, max_depth: usize, out: &mut Schema) {
    match value {
        Value::Object(map) if !map.is_empty() && depth < max_depth => {
            for (key, item) in map {
                infer_into(item, &join(path, key), depth + 1, max_depth, out);
            }
        }
        Value::Array(items) if !items.is_empty() && depth < max_depth => {
            let first = PrimitiveType::of(&items[0]);
            if items.iter().all(|item| PrimitiveType::of(item) == first) {
                let element_path = join(path, "0");
                for item in items {
                    let mut element = Schema::new();
                    infer_into(item, &element_path, depth + 1, max_depth, &mut element);
                    for (key, value_type) in element {
                        let slot = out.entry(key).or_insert(value_type);
                        if *slot == PrimitiveType::Null {
                            *slot = value_type;
                        }
                    }
                }
            } else {
                for (index, item) in items.iter().enumerate() {
                    infer_into(item, &join(path, &index.to_string()), depth + 1, max_depth, out);
                }
            }
        }
        other => {
            out.insert(path.to_string(), PrimitiveType::of(other));
        }
    }
}

/// Every leaf path of `payload` with its value, including every array
/// element.
pub fn flatten(payload: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(payload, "", 0, &mut out);
    out
}

fn flatten_into(value: &Value, path: &str, depth: usize, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() && depth < DEFAULT_MAX_DEPTH => {
            for (key, item) in map {
                flatten_into(item, &join(path, key), depth + 1, out);
            }
        }
        Value::Array(items) if !items.is_empty() && depth < DEFAULT_MAX_DEPTH => {
            for (index, item) in items.iter().enumerate() {
                flatten_into(item, &join(path, &index.to_string()), depth + 1, out);
            }
        }
        other => {
            out.insert(path.to_string(), other.clone());
        }
    }
}

fn variables_of(prefix: &str, source: &str, sample: &Value, out: &mut Vec<TemplateVariable>) {
    for (path, value_type) in infer(sample) {
        out.push(TemplateVariable {
            name: if path.is_empty() {
                prefix.to_string()
            } else {
                join(prefix, &path)
            },
            value_type: value_type.as_str().to_string(),
            source: source.to_string(),
        });
    }
}

/// Variables available to an action: `trigger.<path>` from the trigger
/// sample and `<position>.<path>` from the samples of earlier actions.
pub fn available_variables(
    trigger_sample: Option<&Value>,
    earlier: &[(i32, &Value)],
) -> Vec<TemplateVariable> {
    let mut out = Vec::new();
    if let Some(sample) = trigger_sample {
        variables_of("trigger", "trigger", sample, &mut out);
    }
    for (position, sample) in earlier {
        let prefix = position.to_string();
        variables_of(&prefix, &prefix, sample, &mut out);
    }
    out
}

/// Collapse every array index after the root to `0`, so `items.3.sku`
/// matches the `items.0.sku` an inferred schema lists.
fn index_insensitive(name: &str) -> String {
    name.split('.')
        .enumerate()
        .map(|(i, segment)| {
            if i > 0 && !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                "0"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Whether `name` is a known variable or a container above one. Any
/// numeric index is accepted where the schema has an array element.
pub fn is_known_variable(variables: &[TemplateVariable], name: &str) -> bool {
    let name = index_insensitive(name);
    let container = format!("{name}.");
    variables.iter().any(|v| {
        let known = index_insensitive(&v.name);
        known == name || known.starts_with(&container)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_nested() {
        let schema = infer(&json!({
            "member": {"email": "jane@example.com", "vip": true},
            "amount": 4900,
            "coupon": null,
            "meta": {},
            "notes": []
        }));
        assert_eq!(schema["member.email"], PrimitiveType::String);
        assert_eq!(schema["member.vip"], PrimitiveType::Boolean);
        assert_eq!(schema["amount"], PrimitiveType::Number);
        assert_eq!(schema["coupon"], PrimitiveType::Null);
        assert_eq!(schema["meta"], PrimitiveType::Object);
        assert_eq!(schema["notes"], PrimitiveType::Array);
        assert!(!schema.contains_key("member"));
    }

    #[test]
    fn test_infer_arrays() {
        let schema = infer(&json!({
            "items": [{"sku": "A"}, {"sku": "B"}],
            "mixed": ["a", 1]
        }));
        assert_eq!(schema["items.0.sku"], PrimitiveType::String);
        assert!(!schema.contains_key("items.1.sku"));
        assert_eq!(schema["mixed.0"], PrimitiveType::String);
        assert_eq!(schema["mixed.1"], PrimitiveType::Number);
    }

    #[test]
    fn test_infer_merges_array_element_keys() {
        let schema = infer(&json!({
            "items": [
                {"sku": "A", "coupon": null},
                {"sku": "B", "gift": true, "coupon": "SAVE5"}
            ]
        }));
        assert_eq!(schema["items.0.sku"], PrimitiveType::String);
        assert_eq!(schema["items.0.gift"], PrimitiveType::Boolean);
        assert_eq!(schema["items.0.coupon"], PrimitiveType::String);
        assert_eq!(schema.len(), 3);
    }

    #[test]
    fn test_known_variable_accepts_any_index() {
        let trigger = json!({"items": [{"sku": "A"}, {"sku": "B"}]});
        let first = json!({"id": 7});
        let vars = available_variables(Some(&trigger), &[(1, &first)]);

        assert!(is_known_variable(&vars, "trigger.items.1.sku"));
        assert!(is_known_variable(&vars, "trigger.items.12"));
        assert!(!is_known_variable(&vars, "trigger.items.1.name"));
        assert!(is_known_variable(&vars, "1.id"));
        assert!(!is_known_variable(&vars, "2.id"));
    }

    #[test]
    fn test_infer_depth_limit() {
        let mut payload = json!("leaf");
        for _ in 0..20 {
            payload = json!({ "n": payload });
        }
        let schema = infer(&payload);
        assert_eq!(schema.len(), 1);
        let (path, value_type) = schema.iter().next().unwrap();
        assert_eq!(path.split('.').count(), DEFAULT_MAX_DEPTH);
        assert_eq!(*value_type, PrimitiveType::Object);
    }

    #[test]
    fn test_infer_primitive_root() {
        let schema = infer(&json!("ok"));
        assert_eq!(schema[""], PrimitiveType::String);
    }

    #[test]
    fn test_flatten() {
        let flat = flatten(&json!({"items": [{"sku": "A"}, {"sku": "B"}], "total": 2}));
        assert_eq!(flat["items.0.sku"], json!("A"));
        assert_eq!(flat["items.1.sku"], json!("B"));
        assert_eq!(flat["total"], json!(2));
    }

    #[test]
    fn test_available_variables() {
        let trigger = json!({"member": {"email": "jane@example.com"}});
        let first = json!({"id": 7});
        let vars = available_variables(Some(&trigger), &[(1, &first)]);
        let names: Vec<&str> = vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["trigger.member.email", "1.id"]);
        assert_eq!(vars[1].source, "1");
        assert_eq!(vars[1].value_type, "number");

        assert!(is_known_variable(&vars, "trigger.member"));
        assert!(is_known_variable(&vars, "1.id"));
        assert!(!is_known_variable(&vars, "trigger.mem"));
    }
}
