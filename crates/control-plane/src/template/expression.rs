//! Parsing of `{{...}}` expressions in action configurations.
//!
//! Canonical form is `{{trigger.<dot.path>}}` or `{{<position>.<dot.path>}}`,
//! optionally followed by a filter pipeline (`{{trigger.email | lower}}`).
//! The legacy `{{trigger__email}}` / `{{1__id}}` form is accepted when the
//! path contains no `.` and is normalized to the dot form.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

use super::TemplateError;

fn expression_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").expect("valid template pattern"))
}

/// What an expression reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "position")]
pub enum Root {
    Trigger,
    /// Output of the action at this 1-based position.
    Step(i32),
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Root::Trigger => f.write_str("trigger"),
            Root::Step(position) => write!(f, "{position}"),
        }
    }
}

/// One parsed `{{...}}` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    /// Text between the braces, trimmed.
    pub source: String,
    pub root: Root,
    pub path: Vec<String>,
    /// Filter pipeline after the first `|`, e.g. `lower | default('x')`.
    pub filters: Option<String>,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let source = source.trim();
        let (reference, filters) = match pipes(source).first().copied() {
            Some(at) => {
                let (reference, filters) = (&source[..at], source[at + 1..].trim());
                if filters.is_empty() {
                    return Err(TemplateError::Syntax {
                        expression: source.to_string(),
                        reason: "empty filter".into(),
                    });
                }
                (reference.trim(), Some(filters.to_string()))
            }
            None => (source, None),
        };

        if reference.is_empty() {
            return Err(TemplateError::Syntax {
                expression: source.to_string(),
                reason: "empty reference".into(),
            });
        }

        let normalized = if !reference.contains('.') && reference.contains("__") {
            reference.replace("__", ".")
        } else {
            reference.to_string()
        };

        let mut segments = normalized.split('.').map(str::trim);
        let head = segments.next().unwrap_or_default();
        let root = if head == "trigger" {
            Root::Trigger
        } else if let Ok(position) = head.parse::<i32>() {
            if position < 1 {
                return Err(TemplateError::Syntax {
                    expression: source.to_string(),
                    reason: "step positions start at 1".into(),
                });
            }
            Root::Step(position)
        } else {
            return Err(TemplateError::UnknownRoot {
                expression: source.to_string(),
                root: head.to_string(),
            });
        };

        let path: Vec<String> = segments.map(str::to_string).collect();
        if path.iter().any(|s| s.is_empty()) {
            return Err(TemplateError::Syntax {
                expression: source.to_string(),
                reason: "empty path segment".into(),
            });
        }

        Ok(Self {
            source: source.to_string(),
            root,
            path,
            filters,
        })
    }

    /// `trigger.member.email` / `2.id`: the variable name without filters.
    pub fn variable(&self) -> String {
        let mut name = self.root.to_string();
        for segment in &self.path {
            name.push('.');
            name.push_str(segment);
        }
        name
    }

    /// Whether a missing value falls back to a `default` filter.
    pub fn has_default(&self) -> bool {
        self.filters.as_deref().is_some_and(|filters| {
            let mut start = 0;
            let mut stages = Vec::new();
            for at in pipes(filters) {
                stages.push(&filters[start..at]);
                start = at + 1;
            }
            stages.push(&filters[start..]);
            stages.into_iter().any(|f| {
                let name = f.split('(').next().unwrap_or_default().trim();
                name == "default" || name == "d"
            })
        })
    }
}

/// Byte offsets of the `|` separators that are outside quotes and
/// parentheses.
fn pipes(text: &str) -> Vec<usize> {
    let mut found = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut escaped = false;
    for (at, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '|' if depth == 0 => found.push(at),
            _ => {}
        }
    }
    found
}

/// A template occurrence inside a string.
#[derive(Debug, Clone)]
pub(crate) struct Occurrence<'a> {
    pub start: usize,
    pub end: usize,
    pub inner: &'a str,
}

pub(crate) fn occurrences(text: &str) -> Vec<Occurrence<'_>> {
    expression_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let inner = caps.get(1)?;
            Some(Occurrence {
                start: whole.start(),
                end: whole.end(),
                inner: inner.as_str(),
            })
        })
        .collect()
}

/// The single expression `text` consists of, if it is nothing else.
pub(crate) fn sole_expression(text: &str) -> Option<&str> {
    let found = occurrences(text);
    match found.as_slice() {
        [only] if only.start == 0 && only.end == text.len() => Some(only.inner),
        _ => None,
    }
}

/// Every expression found in a configuration value, in document order.
///
/// Unparseable expressions are reported as errors so configuration-time
/// validation can reject them.
pub fn references(config: &Value) -> Result<Vec<Expression>, TemplateError> {
    let mut found = Vec::new();
    collect(config, &mut found)?;
    Ok(found)
}

fn collect(value: &Value, found: &mut Vec<Expression>) -> Result<(), TemplateError> {
    match value {
        Value::String(s) => {
            for occurrence in occurrences(s) {
                found.push(Expression::parse(occurrence.inner)?);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}
