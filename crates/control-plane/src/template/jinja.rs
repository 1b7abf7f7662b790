//! Filter pipelines on resolved values, evaluated with minijinja.
//!
//! The path part of an expression is resolved by
//! [`ResolutionContext`](super::ResolutionContext); only the pipeline after
//! `|` is handed to minijinja, with the resolved value bound as `value`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{context, Environment, Error, ErrorKind, Value};

/// Evaluates `value | filter | ...` pipelines.
pub struct FilterPipeline {
    env: Environment<'static>,
}

impl Default for FilterPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterPipeline {
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_filter("lower", filter_lower);
        env.add_filter("upper", filter_upper);
        env.add_filter("trim", filter_trim);
        env.add_filter("default", filter_default);
        env.add_filter("d", filter_default);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("length", filter_length);
        env.add_filter("first", filter_first);
        env.add_filter("last", filter_last);
        env.add_filter("join", filter_join);

        Self { env }
    }

    /// Apply `filters` to `value`. `None` means the path did not resolve;
    /// only a `default` filter turns that into a value.
    pub fn apply(
        &self,
        value: Option<&serde_json::Value>,
        filters: &str,
    ) -> Result<serde_json::Value, String> {
        let source = format!("value | {filters}");
        let expression = self
            .env
            .compile_expression(&source)
            .map_err(|e| format!("Filter parse error: {e}"))?;

        let ctx = match value {
            Some(v) => context! { value => Value::from_serialize(v) },
            None => context! {},
        };

        let result = expression
            .eval(ctx)
            .map_err(|e| format!("Filter error: {e}"))?;
        if result.is_undefined() {
            return Err("Filter produced no value".into());
        }
        serde_json::to_value(&result).map_err(|e| format!("Filter result error: {e}"))
    }
}

/// Missing values pass through string filters untouched so a later
/// `default` still sees them as missing.
fn map_text(value: &Value, f: impl FnOnce(&str) -> String) -> Value {
    if value.is_undefined() || value.is_none() {
        return value.clone();
    }
    Value::from(f(&value.to_string()))
}

fn filter_lower(value: &Value) -> Value {
    map_text(value, str::to_lowercase)
}

fn filter_upper(value: &Value) -> Value {
    map_text(value, str::to_uppercase)
}

fn filter_trim(value: &Value) -> Value {
    map_text(value, |s| s.trim().to_string())
}

fn filter_default(value: &Value, default: Option<&Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.cloned().unwrap_or(Value::from(""))
    } else {
        value.clone()
    }
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_b64encode(value: &Value) -> String {
    BASE64.encode(value.to_string().as_bytes())
}

fn filter_length(value: &Value) -> Result<usize, Error> {
    if let Some(s) = value.as_str() {
        return Ok(s.chars().count());
    }
    value.len().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidOperation,
            "length requires string, sequence, or mapping",
        )
    })
}

fn filter_first(value: &Value) -> Result<Value, Error> {
    let mut iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "first requires a sequence"))?;
    Ok(iter.next().unwrap_or(Value::UNDEFINED))
}

fn filter_last(value: &Value) -> Result<Value, Error> {
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "last requires a sequence"))?;
    Ok(iter.last().unwrap_or(Value::UNDEFINED))
}

fn filter_join(value: &Value, sep: Option<&Value>) -> Result<String, Error> {
    let separator = sep.map(|v| v.to_string()).unwrap_or_default();
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "join requires a sequence"))?;
    let items: Vec<String> = iter.map(|v| v.to_string()).collect();
    Ok(items.join(&separator))
}
