//! Trigger conditions.
//!
//! A trigger's `conditions` is an object of `dot.path -> expected`, where
//! `expected` is either a literal (equality) or an operator object such as
//! `{"gte": 1000}` or `{"in": ["gold", "vip"]}`. Every entry must hold for
//! the trigger to match an event.

use serde_json::Value;
use std::cmp::Ordering;

use crate::error::{AppError, AppResult};
use crate::template::lookup_path;

const OPERATORS: &[&str] = &["eq", "ne", "gt", "gte", "lt", "lte", "in", "contains", "exists"];

/// One comparison against the value found at a path.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Contains(Value),
    Exists(bool),
}

impl Operator {
    fn parse(name: &str, operand: &Value) -> AppResult<Self> {
        Ok(match name {
            "eq" => Operator::Eq(operand.clone()),
            "ne" => Operator::Ne(operand.clone()),
            "gt" => Operator::Gt(operand.clone()),
            "gte" => Operator::Gte(operand.clone()),
            "lt" => Operator::Lt(operand.clone()),
            "lte" => Operator::Lte(operand.clone()),
            "in" => match operand {
                Value::Array(items) => Operator::In(items.clone()),
                _ => {
                    return Err(AppError::Validation(
                        "Condition operator 'in' expects a list".to_string(),
                    ))
                }
            },
            "contains" => Operator::Contains(operand.clone()),
            "exists" => match operand {
                Value::Bool(b) => Operator::Exists(*b),
                _ => {
                    return Err(AppError::Validation(
                        "Condition operator 'exists' expects true or false".to_string(),
                    ))
                }
            },
            other => {
                return Err(AppError::Validation(format!(
                    "Unknown condition operator '{other}'"
                )))
            }
        })
    }

    fn holds(&self, actual: Option<&Value>) -> bool {
        let present = actual.filter(|v| !v.is_null());
        match self {
            Operator::Exists(expected) => present.is_some() == *expected,
            Operator::Eq(expected) => actual.is_some_and(|a| loose_eq(a, expected)),
            Operator::Ne(expected) => !actual.is_some_and(|a| loose_eq(a, expected)),
            Operator::Gt(expected) => compare(present, expected) == Some(Ordering::Greater),
            Operator::Gte(expected) => matches!(
                compare(present, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt(expected) => compare(present, expected) == Some(Ordering::Less),
            Operator::Lte(expected) => matches!(
                compare(present, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In(options) => {
                present.is_some_and(|a| options.iter().any(|option| loose_eq(a, option)))
            }
            Operator::Contains(needle) => match (present, needle) {
                (Some(Value::String(hay)), Value::String(needle)) => hay.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.iter().any(|i| loose_eq(i, needle)),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    path: Vec<String>,
    operators: Vec<Operator>,
}

/// Parsed trigger conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    entries: Vec<Condition>,
}

impl Conditions {
    /// Parse a conditions object. `null` means no conditions.
    pub fn parse(raw: &Value) -> AppResult<Self> {
        let object = match raw {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            _ => {
                return Err(AppError::Validation(
                    "Trigger conditions must be an object".to_string(),
                ))
            }
        };

        let mut entries = Vec::with_capacity(object.len());
        for (path, expected) in object {
            let segments: Vec<String> = path.split('.').map(str::to_string).collect();
            if segments.iter().any(String::is_empty) {
                return Err(AppError::Validation(format!(
                    "Invalid condition path '{path}'"
                )));
            }

            let operators = match expected {
                Value::Object(ops) if is_operator_object(ops) => ops
                    .iter()
                    .map(|(name, operand)| Operator::parse(name, operand))
                    .collect::<AppResult<Vec<_>>>()?,
                literal => vec![Operator::Eq(literal.clone())],
            };
            entries.push(Condition {
                path: segments,
                operators,
            });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every condition holds for `data`.
    pub fn matches(&self, data: &Value) -> bool {
        self.entries.iter().all(|condition| {
            let actual = lookup_path(data, condition.path.as_slice());
            condition.operators.iter().all(|op| op.holds(actual))
        })
    }
}

/// An object is read as operators when every key is an operator name.
fn is_operator_object(map: &serde_json::Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| OPERATORS.contains(&k.as_str()))
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}
