//! Redaction of secrets before step data is logged or persisted.

use serde_json::{Map, Value};

const REDACTED: &str = "[REDACTED]";

const MAX_DEPTH: usize = 20;

/// Key fragments that mark a value as secret (compared lowercase, `-` as `_`).
static SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "private_key",
    "client_secret",
    "cookie",
    "session",
    "card_number",
    "cvc",
    "cvv",
    "iban",
];

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase().replace('-', "_");
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

fn is_sensitive_value(value: &str) -> bool {
    let lower = value.to_lowercase();
    if lower.starts_with("bearer ") || lower.starts_with("basic ") {
        return true;
    }

    // JWT
    if value.starts_with("eyJ") && value.matches('.').count() == 2 && value.len() > 50 {
        return true;
    }

    // Payment processor secret keys
    lower.starts_with("sk_live_") || lower.starts_with("rk_live_")
}

/// Return a copy of `value` with secrets replaced by `[REDACTED]`.
pub fn redact(value: &Value) -> Value {
    redact_at(value, 0)
}

fn redact_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return value.clone();
    }

    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                let redacted = if is_sensitive_key(key) && !val.is_null() {
                    Value::String(REDACTED.to_string())
                } else {
                    redact_at(val, depth + 1)
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_at(v, depth + 1)).collect()),
        Value::String(s) if is_sensitive_value(s) => Value::String(REDACTED.to_string()),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_keys() {
        let data = json!({"email": "jane@example.com", "api_key": "abc", "Access-Token": "t"});
        let result = redact(&data);
        assert_eq!(result["email"], "jane@example.com");
        assert_eq!(result["api_key"], "[REDACTED]");
        assert_eq!(result["Access-Token"], "[REDACTED]");
    }

    #[test]
    fn test_redact_nested_and_arrays() {
        let data = json!({
            "payment": {"card_number": "4242424242424242", "amount": 4900},
            "headers": [{"authorization": "Bearer xyz"}]
        });
        let result = redact(&data);
        assert_eq!(result["payment"]["card_number"], "[REDACTED]");
        assert_eq!(result["payment"]["amount"], 4900);
        assert_eq!(result["headers"][0]["authorization"], "[REDACTED]");
    }

    #[test]
    fn test_redact_values() {
        let data = json!({"note": "Bearer abc", "key": "sk_live_123", "plain": "hello"});
        let result = redact(&data);
        assert_eq!(result["note"], "[REDACTED]");
        assert_eq!(result["key"], "[REDACTED]");
        assert_eq!(result["plain"], "hello");
    }

    #[test]
    fn test_non_sensitive_preserved() {
        let data = json!({"name": "test", "count": 42, "tags": ["a", "b"], "token": null});
        assert_eq!(redact(&data), data);
    }
}
