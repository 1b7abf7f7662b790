//! Action execution error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error taxonomy recorded on workflow steps.
///
/// The serialized names are part of the persisted step shape and must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ValidationError,
    ResolutionError,
    AuthError,
    #[serde(rename = "ExternalAPIError")]
    ExternalApiError,
    TimeoutError,
    InternalError,
    AbortedError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "ValidationError",
            ErrorCode::ResolutionError => "ResolutionError",
            ErrorCode::AuthError => "AuthError",
            ErrorCode::ExternalApiError => "ExternalAPIError",
            ErrorCode::TimeoutError => "TimeoutError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::AbortedError => "AbortedError",
        }
    }

    /// Parse a persisted error code.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ValidationError" => Some(ErrorCode::ValidationError),
            "ResolutionError" => Some(ErrorCode::ResolutionError),
            "AuthError" => Some(ErrorCode::AuthError),
            "ExternalAPIError" => Some(ErrorCode::ExternalApiError),
            "TimeoutError" => Some(ErrorCode::TimeoutError),
            "InternalError" => Some(ErrorCode::InternalError),
            "AbortedError" => Some(ErrorCode::AbortedError),
            _ => None,
        }
    }

    /// Whether a step failing with this code is retried in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::ExternalApiError | ErrorCode::TimeoutError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while running an action, trigger test or
/// resource search.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// Action, trigger or resource not found in registry.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration or argument did not match the declared schema.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Credentials missing, rejected or expired.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The third-party API answered with an error or could not be reached.
    #[error("External API error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    ExternalApi { status: Option<u16>, message: String },

    /// The call did not complete within its bound.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ActionError {
    pub fn external(status: Option<u16>, message: impl Into<String>) -> Self {
        ActionError::ExternalApi {
            status,
            message: message.into(),
        }
    }

    /// Map to the persisted error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ActionError::Validation(_) => ErrorCode::ValidationError,
            ActionError::Auth(_) => ErrorCode::AuthError,
            ActionError::ExternalApi { .. } => ErrorCode::ExternalApiError,
            ActionError::Timeout(_) => ErrorCode::TimeoutError,
            ActionError::NotFound(_) | ActionError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// True for HTTP 429 answers, which also put the integration into cooldown.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ActionError::ExternalApi { status: Some(429), .. })
    }
}

impl From<serde_json::Error> for ActionError {
    fn from(e: serde_json::Error) -> Self {
        ActionError::Internal(format!("JSON error: {e}"))
    }
}

impl From<reqwest::Error> for ActionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return ActionError::Timeout(0);
        }
        let status = e.status().map(|s| s.as_u16());
        match status {
            Some(401) | Some(403) => ActionError::Auth(e.to_string()),
            _ => ActionError::external(status, e.to_string()),
        }
    }
}
