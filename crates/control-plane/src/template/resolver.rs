//! Resolution of configuration values against one run's data.

use funnelflow_actions::{Configuration, FieldSchema};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use super::expression::{occurrences, sole_expression, Expression, Root};
use super::jinja::FilterPipeline;
use super::TemplateError;

/// Walk `path` through maps and arrays. Array elements are only reached by
/// an explicit numeric segment.
pub fn lookup_path<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Data visible to templates during one execution of a run: the trigger
/// payload and the outputs of the steps completed so far.
///
/// Resolved expressions are memoized. Steps are only ever added for
/// positions that no expression could read before, so memoized values never
/// go stale.
pub struct ResolutionContext {
    trigger: Value,
    steps: BTreeMap<i32, Value>,
    memo: HashMap<String, Value>,
    filters: FilterPipeline,
}

impl ResolutionContext {
    pub fn new(trigger: Value) -> Self {
        Self {
            trigger,
            steps: BTreeMap::new(),
            memo: HashMap::new(),
            filters: FilterPipeline::new(),
        }
    }

    /// Context of a run: its arguments plus the `{"<position>": output}`
    /// aggregate of the current attempt.
    pub fn from_run(arguments: Value, aggregate: &Value) -> Self {
        let mut ctx = Self::new(arguments);
        if let Value::Object(map) = aggregate {
            for (key, output) in map {
                if let Ok(position) = key.parse::<i32>() {
                    ctx.steps.insert(position, output.clone());
                }
            }
        }
        ctx
    }

    pub fn record_step(&mut self, position: i32, output: Value) {
        self.steps.insert(position, output);
    }

    pub fn trigger(&self) -> &Value {
        &self.trigger
    }

    /// Evaluate one expression for the action at `position`.
    pub fn evaluate(&mut self, expr: &Expression, position: i32) -> Result<Value, TemplateError> {
        if let Root::Step(step) = expr.root {
            if step >= position {
                return Err(TemplateError::ForwardReference {
                    expression: expr.source.clone(),
                    step,
                    position,
                });
            }
        }

        if let Some(cached) = self.memo.get(&expr.source) {
            return Ok(cached.clone());
        }

        let base = match expr.root {
            Root::Trigger => Some(&self.trigger),
            Root::Step(step) => self.steps.get(&step),
        };
        let found = base.and_then(|v| lookup_path(v, expr.path.as_slice()));

        let resolved = match (&expr.filters, found) {
            (None, Some(value)) => value.clone(),
            (Some(filters), found) if found.is_some() || expr.has_default() => self
                .filters
                .apply(found, filters)
                .map_err(|message| TemplateError::Filter {
                    expression: expr.source.clone(),
                    message,
                })?,
            _ => {
                return Err(TemplateError::Missing {
                    expression: expr.source.clone(),
                    variable: expr.variable(),
                })
            }
        };

        self.memo.insert(expr.source.clone(), resolved.clone());
        Ok(resolved)
    }

    /// Resolve a string. A string that is exactly one expression keeps the
    /// resolved value's type; otherwise expressions are interpolated as text.
    pub fn resolve_str(&mut self, text: &str, position: i32) -> Result<Value, TemplateError> {
        if let Some(inner) = sole_expression(text) {
            let expr = Expression::parse(inner)?;
            return self.evaluate(&expr, position);
        }

        let found = occurrences(text);
        if found.is_empty() {
            return Ok(Value::String(text.to_string()));
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for occurrence in found {
            out.push_str(&text[cursor..occurrence.start]);
            let expr = Expression::parse(occurrence.inner)?;
            match self.evaluate(&expr, position)? {
                Value::String(s) => out.push_str(&s),
                other => out.push_str(&other.to_string()),
            }
            cursor = occurrence.end;
        }
        out.push_str(&text[cursor..]);
        Ok(Value::String(out))
    }

    /// Resolve every string inside `value`. Object keys are left alone.
    pub fn resolve_value(&mut self, value: &Value, position: i32) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.resolve_str(s, position),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, position))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.resolve_value(item, position)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve one field. Multiple-value fields resolve per element and
    /// flatten elements that resolve to lists. A missing reference in an
    /// optional field yields the field's empty value.
    pub fn resolve_field(
        &mut self,
        field: &FieldSchema,
        raw: &Value,
        position: i32,
    ) -> Result<Value, TemplateError> {
        let resolved = if field.multiple {
            self.resolve_multiple(raw, position)
        } else {
            self.resolve_value(raw, position)
        };

        match resolved {
            Err(e) if e.is_missing() && !field.required => Ok(field.empty_value()),
            other => other,
        }
    }

    fn resolve_multiple(&mut self, raw: &Value, position: i32) -> Result<Value, TemplateError> {
        let items = match raw {
            Value::Array(items) => items.as_slice(),
            other => std::slice::from_ref(other),
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match self.resolve_value(item, position)? {
                Value::Array(nested) => out.extend(nested),
                value => out.push(value),
            }
        }
        Ok(Value::Array(out))
    }

    /// Resolve a validated configuration against its schema, field by field.
    pub fn resolve_configuration(
        &mut self,
        schema: &[FieldSchema],
        config: &Configuration,
        position: i32,
    ) -> Result<Map<String, Value>, TemplateError> {
        let mut out = Map::new();
        for field in schema {
            if let Some(value) = config.get(&field.key) {
                let resolved = self.resolve_field(field, &value.to_json(), position)?;
                out.insert(field.key.clone(), resolved);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnelflow_actions::{validate_configuration, FieldType};
    use serde_json::json;

    fn purchase() -> Value {
        json!({
            "member": {"email": "jane@example.com", "name": "Jane"},
            "amount": 4900,
            "items": [{"sku": "A1"}, {"sku": "B2"}],
            "tags": ["vip", "new"]
        })
    }

    #[test]
    fn test_lookup_path() {
        let data = purchase();
        assert_eq!(lookup_path(&data, &["member", "email"]), Some(&json!("jane@example.com")));
        assert_eq!(lookup_path(&data, &["items", "1", "sku"]), Some(&json!("B2")));
        assert_eq!(lookup_path(&data, &["items", "sku"]), None);
        assert_eq!(lookup_path(&data, &["member", "phone"]), None);
    }

    #[test]
    fn test_trigger_reference_resolves() {
        let mut ctx = ResolutionContext::new(purchase());
        let value = ctx.resolve_str("{{trigger.member.email}}", 1).unwrap();
        assert_eq!(value, json!("jane@example.com"));
    }

    #[test]
    fn test_sole_expression_keeps_type() {
        let mut ctx = ResolutionContext::new(purchase());
        assert_eq!(ctx.resolve_str("{{ trigger.amount }}", 1).unwrap(), json!(4900));
        assert_eq!(ctx.resolve_str("{{trigger.tags}}", 1).unwrap(), json!(["vip", "new"]));
    }

    #[test]
    fn test_interpolation() {
        let mut ctx = ResolutionContext::new(purchase());
        let value = ctx
            .resolve_str("{{trigger.member.name}} paid {{trigger.amount}} for {{trigger.tags}}", 1)
            .unwrap();
        assert_eq!(value, json!("Jane paid 4900 for [\"vip\",\"new\"]"));
    }

    #[test]
    fn test_step_reference_and_legacy_alias() {
        let mut ctx = ResolutionContext::new(purchase());
        ctx.record_step(1, json!({"id": 77, "contact": {"email": "j@x.io"}}));
        assert_eq!(ctx.resolve_str("{{1.id}}", 2).unwrap(), json!(77));
        assert_eq!(ctx.resolve_str("{{1__id}}", 2).unwrap(), json!(77));
        assert_eq!(
            ctx.resolve_str("{{trigger__member__email}}", 2).unwrap(),
            json!("jane@example.com")
        );
    }

    #[test]
    fn test_forward_reference_rejected() {
        let mut ctx = ResolutionContext::new(purchase());
        ctx.record_step(2, json!({"id": 1}));
        let err = ctx.resolve_str("{{2.id}}", 2).unwrap_err();
        assert!(matches!(err, TemplateError::ForwardReference { step: 2, position: 2, .. }));
    }

    #[test]
    fn test_missing_path() {
        let mut ctx = ResolutionContext::new(purchase());
        let err = ctx.resolve_str("{{trigger.member.phone}}", 1).unwrap_err();
        assert!(err.is_missing());
        let err = ctx.resolve_str("{{1.id}}", 2).unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn test_filters_and_default() {
        let mut ctx = ResolutionContext::new(purchase());
        assert_eq!(ctx.resolve_str("{{trigger.member.name | upper}}", 1).unwrap(), json!("JANE"));
        assert_eq!(
            ctx.resolve_str("{{trigger.member.phone | default('none')}}", 1).unwrap(),
            json!("none")
        );
        assert!(ctx.resolve_str("{{trigger.member.phone | upper}}", 1).unwrap_err().is_missing());
        assert_eq!(
            ctx.resolve_str("{{trigger.member.phone | upper | default('x')}}", 1).unwrap(),
            json!("x")
        );
        assert_eq!(
            ctx.resolve_str("{{trigger.member.phone | default('a|b')}}", 1).unwrap(),
            json!("a|b")
        );
    }

    #[test]
    fn test_memoization_returns_same_value() {
        let mut ctx = ResolutionContext::new(purchase());
        let first = ctx.resolve_str("{{trigger.member.email | lower}}", 1).unwrap();
        let second = ctx.resolve_str("{{trigger.member.email | lower}}", 3).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.memo.len(), 1);
    }

    #[test]
    fn test_optional_field_falls_back_to_empty() {
        let mut ctx = ResolutionContext::new(purchase());
        let optional = FieldSchema::text("note", "Note");
        let required = FieldSchema::text("email", "Email").required();
        let tags = FieldSchema::text("tags", "Tags").multiple();

        assert_eq!(ctx.resolve_field(&optional, &json!("{{trigger.nope}}"), 1).unwrap(), json!(""));
        assert!(ctx.resolve_field(&required, &json!("{{trigger.nope}}"), 1).is_err());
        assert_eq!(ctx.resolve_field(&tags, &json!(["{{trigger.nope}}"]), 1).unwrap(), json!([]));
    }

    #[test]
    fn test_multiple_field_resolves_per_element() {
        let mut ctx = ResolutionContext::new(purchase());
        let tags = FieldSchema::text("tags", "Tags").multiple();
        let resolved = ctx
            .resolve_field(&tags, &json!(["{{trigger.tags}}", "{{trigger.member.name}}", "static"]), 1)
            .unwrap();
        assert_eq!(resolved, json!(["vip", "new", "Jane", "static"]));
    }

    #[test]
    fn test_resolve_configuration() {
        let schema = vec![
            FieldSchema::new("to", "To", FieldType::Email).required(),
            FieldSchema::new("payload", "Payload", FieldType::Json),
        ];
        let config = validate_configuration(
            &schema,
            &json!({"to": "{{trigger.member.email}}", "payload": {"amount": "{{trigger.amount}}"}}),
        )
        .unwrap();
        let mut ctx = ResolutionContext::new(purchase());
        let resolved = ctx.resolve_configuration(&schema, &config, 1).unwrap();
        assert_eq!(resolved["to"], json!("jane@example.com"));
        assert_eq!(resolved["payload"], json!({"amount": 4900}));
    }

    #[test]
    fn test_from_run_aggregate() {
        let mut ctx = ResolutionContext::from_run(purchase(), &json!({"1": {"id": 9}}));
        assert_eq!(ctx.resolve_str("{{1.id}}", 2).unwrap(), json!(9));
    }
}
