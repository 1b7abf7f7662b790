//! Workflow run ledger models.
//!
//! A run is one execution of a sequence for one event. Each attempt of a
//! run writes its own step rows; force-rerun opens a new attempt.

use chrono::{DateTime, Utc};
use funnelflow_actions::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Waiting,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Waiting => "waiting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "waiting" => Some(RunStatus::Waiting),
            _ => None,
        }
    }

    /// A finished run: nothing executes until an operator acts on it.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Waiting
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Waiting)
                | (Failed, Running)
                | (Waiting, Running)
                | (Waiting, Failed)
        )
    }

    /// Worst status among step statuses: failed > waiting > running >
    /// pending > completed/skipped. No steps means pending.
    pub fn worst_of<I: IntoIterator<Item = StepStatus>>(statuses: I) -> RunStatus {
        let mut worst: Option<RunStatus> = None;
        for status in statuses {
            let candidate = match status {
                StepStatus::Failed => RunStatus::Failed,
                StepStatus::Waiting => RunStatus::Waiting,
                StepStatus::Running => RunStatus::Running,
                StepStatus::Pending => RunStatus::Pending,
                StepStatus::Completed | StepStatus::Skipped => RunStatus::Completed,
            };
            worst = Some(match worst {
                Some(current) if current.severity() >= candidate.severity() => current,
                _ => candidate,
            });
        }
        worst.unwrap_or(RunStatus::Pending)
    }

    fn severity(&self) -> u8 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::Pending => 1,
            RunStatus::Running => 2,
            RunStatus::Waiting => 3,
            RunStatus::Failed => 4,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Waiting,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Waiting => "waiting",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "waiting" => Some(StepStatus::Waiting),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }

    /// Rows in a terminal state are never updated again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// Done as far as resumption is concerned.
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Waiting)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a sequence for one event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub id: i64,
    pub sequence_id: i64,
    pub trigger_id: i64,
    pub event_id: i64,
    pub status: RunStatus,
    pub attempt: i32,
    /// Event data snapshot
    pub arguments: Value,
    /// `{"<position>": output}` of completed steps in the current attempt
    pub output: Value,
    pub stale: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub sequence_id: i64,
    pub trigger_id: i64,
    pub event_id: i64,
    pub arguments: Value,
}

/// One execution of one action within a run attempt.
///
/// Field names are consumed by external tooling and must stay stable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: i64,
    pub run_id: i64,
    pub attempt: i32,
    /// Action id
    pub node_id: i64,
    pub node_name: String,
    /// `app.action_key`
    pub node_type: String,
    pub position: i32,
    pub status: StepStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub raw_response: Option<Value>,
    pub processed_output: Option<Value>,
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub retry_count: i32,
    pub debug_info: Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub run_id: i64,
    pub attempt: i32,
    pub node_id: i64,
    pub node_name: String,
    pub node_type: String,
    pub position: i32,
    /// `running` for dispatched steps; terminal for steps settled at dispatch
    pub status: StepStatus,
    pub input_data: Value,
    pub debug_info: Value,
}

/// Terminal state written by [`finish_step`](crate::store::RunLedger::finish_step).
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub output_data: Option<Value>,
    pub raw_response: Option<Value>,
    pub processed_output: Option<Value>,
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub debug_info: Option<Value>,
}

impl StepOutcome {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Append-only run log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunLogEntry {
    pub id: i64,
    pub run_id: i64,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

fn default_limit() -> i64 {
    50
}

/// Query of `GET /workflows`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub sequence_id: Option<i64>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            sequence_id: None,
            status: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListResponse {
    pub items: Vec<WorkflowRun>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDuration {
    pub step_id: i64,
    pub position: i32,
    pub node_name: String,
    pub duration_ms: Option<i64>,
}

/// Aggregates over the current attempt's steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub waiting_steps: usize,
    pub skipped_steps: usize,
    pub total_duration_ms: i64,
    pub step_durations: Vec<StepDuration>,
}

impl RunSummary {
    pub fn from_steps(steps: &[WorkflowStep]) -> Self {
        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
        Self {
            total_steps: steps.len(),
            completed_steps: count(StepStatus::Completed),
            failed_steps: count(StepStatus::Failed),
            waiting_steps: count(StepStatus::Waiting),
            skipped_steps: count(StepStatus::Skipped),
            total_duration_ms: steps.iter().filter_map(|s| s.duration_ms).sum(),
            step_durations: steps
                .iter()
                .map(|s| StepDuration {
                    step_id: s.id,
                    position: s.position,
                    node_name: s.node_name.clone(),
                    duration_ms: s.duration_ms,
                })
                .collect(),
        }
    }
}

/// `GET /workflows/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: WorkflowRun,
    /// Steps of every attempt, oldest first
    pub steps: Vec<WorkflowStep>,
    pub logs: Vec<RunLogEntry>,
    /// Computed over the current attempt
    pub summary: RunSummary,
}

/// Result of rerun, force-rerun and cancel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryOutcome {
    pub performed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub run_id: i64,
    pub status: RunStatus,
    pub attempt: i32,
}

/// Insert `value` under `position` in a run output aggregate.
pub fn merge_output(aggregate: &Value, position: i32, value: Value) -> Value {
    let mut map = match aggregate {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert(position.to_string(), value);
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worst_of() {
        use StepStatus::*;
        assert_eq!(RunStatus::worst_of([Completed, Skipped]), RunStatus::Completed);
        assert_eq!(RunStatus::worst_of([Completed, Running]), RunStatus::Running);
        assert_eq!(RunStatus::worst_of([Waiting, Running, Completed]), RunStatus::Waiting);
        assert_eq!(RunStatus::worst_of([Waiting, Failed]), RunStatus::Failed);
        assert_eq!(RunStatus::worst_of([Pending, Completed]), RunStatus::Pending);
        assert_eq!(RunStatus::worst_of(Vec::new()), RunStatus::Pending);
    }

    #[test]
    fn test_step_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Waiting));
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::Waiting.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn test_run_transitions() {
        assert!(RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_value(RunStatus::Waiting).unwrap(), json!("waiting"));
        assert_eq!(StepStatus::parse("skipped"), Some(StepStatus::Skipped));
        assert_eq!(RunStatus::parse("nope"), None);
    }

    #[test]
    fn test_merge_output() {
        let aggregate = merge_output(&json!({}), 1, json!({"id": 5}));
        let aggregate = merge_output(&aggregate, 2, json!("ok"));
        assert_eq!(aggregate, json!({"1": {"id": 5}, "2": "ok"}));
    }

    #[test]
    fn test_summary() {
        let now = Utc::now();
        let step = |id, status, duration| WorkflowStep {
            id,
            run_id: 1,
            attempt: 1,
            node_id: id,
            node_name: format!("step {id}"),
            node_type: "utility.compose".into(),
            position: id as i32,
            status,
            input_data: json!({}),
            output_data: None,
            raw_response: None,
            processed_output: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            debug_info: json!({}),
            started_at: now,
            completed_at: None,
            duration_ms: duration,
        };
        let summary = RunSummary::from_steps(&[
            step(1, StepStatus::Completed, Some(10)),
            step(2, StepStatus::Failed, Some(5)),
            step(3, StepStatus::Skipped, None),
        ]);
        assert_eq!(summary.total_steps, 3);
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.skipped_steps, 1);
        assert_eq!(summary.total_duration_ms, 15);
        assert_eq!(summary.step_durations[1].duration_ms, Some(5));
    }
}
