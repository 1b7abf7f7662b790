//! Inbound event model. Events are immutable once stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: i64,
    pub app_key: String,
    pub trigger_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<i64>,
    pub event_data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub app_key: String,
    pub trigger_key: String,
    pub integration_id: Option<i64>,
    pub event_data: Value,
}

/// Query string of `POST /events/{app_key}/{trigger_key}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventQuery {
    pub integration_id: Option<i64>,
}

/// Response after ingesting an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventIngestResponse {
    pub event_id: i64,
    /// Runs created for matching triggers
    pub run_ids: Vec<i64>,
}
