//! Template resolution for action configurations.
//!
//! `{{trigger.<path>}}` reads the triggering event; `{{<position>.<path>}}`
//! reads the output of an earlier action of the same run.

pub mod expression;
pub mod jinja;
pub mod resolver;

use thiserror::Error;

pub use expression::{references, Expression, Root};
pub use jinja::FilterPipeline;
pub use resolver::{lookup_path, ResolutionContext};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Invalid expression '{{{{{expression}}}}}': {reason}")]
    Syntax { expression: String, reason: String },

    #[error("Unknown reference '{root}' in '{{{{{expression}}}}}': use 'trigger' or a step position")]
    UnknownRoot { expression: String, root: String },

    #[error("'{{{{{expression}}}}}' references step {step}, which does not run before step {position}")]
    ForwardReference {
        expression: String,
        step: i32,
        position: i32,
    },

    #[error("'{{{{{expression}}}}}' did not resolve: no value at '{variable}'")]
    Missing { expression: String, variable: String },

    #[error("'{{{{{expression}}}}}': {message}")]
    Filter { expression: String, message: String },
}

impl TemplateError {
    pub fn is_missing(&self) -> bool {
        matches!(self, TemplateError::Missing { .. })
    }
}
