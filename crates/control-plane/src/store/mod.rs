//! Persistence boundary.
//!
//! [`Store`] bundles the integration store, sequence configuration, event
//! log and the workflow run ledger. Two implementations exist: Postgres
//! ([`PgStore`]) and in-process ([`MemoryStore`]), used for tests and for
//! `FUNNEL_STORE=memory`.
//!
//! Every status change of a run is a compare-and-set: callers name the
//! statuses they expect and receive `None` when the run was not in one of
//! them.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::db::models::{
    Event, Integration, IntegrationState, LogLevel, NewAction, NewEvent, NewIntegration, NewRun,
    NewSequence, NewStep, NewTrigger, RunFilter, RunLogEntry, RunStatus, Sequence, SequenceAction,
    SequenceTrigger, StepOutcome, StepStatus, WorkflowRun, WorkflowStep,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid stored value: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn create_integration(&self, new: NewIntegration) -> StoreResult<Integration>;

    async fn get_integration(&self, id: i64) -> StoreResult<Option<Integration>>;

    async fn list_integrations(&self, tenant_id: Option<&str>) -> StoreResult<Vec<Integration>>;

    async fn delete_integration(&self, id: i64) -> StoreResult<bool>;

    /// Set the connection state; `tested` also stamps `last_tested_at`.
    async fn set_integration_state(
        &self,
        id: i64,
        state: IntegrationState,
        message: Option<String>,
        tested: bool,
    ) -> StoreResult<Option<Integration>>;
}

/// Sequences with their triggers and actions.
///
/// Action positions of a sequence are kept dense from 1 by every mutation.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn create_sequence(&self, new: NewSequence) -> StoreResult<Sequence>;

    async fn get_sequence(&self, id: i64) -> StoreResult<Option<Sequence>>;

    async fn list_sequences(&self, tenant_id: Option<&str>) -> StoreResult<Vec<Sequence>>;

    async fn set_sequence_enabled(&self, id: i64, enabled: bool) -> StoreResult<Option<Sequence>>;

    /// Deletes triggers and actions too. Runs are kept.
    async fn delete_sequence(&self, id: i64) -> StoreResult<bool>;

    async fn create_trigger(&self, new: NewTrigger) -> StoreResult<SequenceTrigger>;

    async fn get_trigger(&self, id: i64) -> StoreResult<Option<SequenceTrigger>>;

    async fn list_triggers(&self, sequence_id: i64) -> StoreResult<Vec<SequenceTrigger>>;

    /// Triggers of any sequence listening for `(app_key, trigger_key)`.
    async fn find_triggers(&self, app_key: &str, trigger_key: &str)
        -> StoreResult<Vec<SequenceTrigger>>;

    async fn delete_trigger(&self, id: i64) -> StoreResult<bool>;

    async fn set_trigger_sample(&self, id: i64, sample: Value) -> StoreResult<()>;

    async fn insert_action(&self, new: NewAction) -> StoreResult<SequenceAction>;

    async fn get_action(&self, id: i64) -> StoreResult<Option<SequenceAction>>;

    /// Ordered by position.
    async fn list_actions(&self, sequence_id: i64) -> StoreResult<Vec<SequenceAction>>;

    async fn delete_action(&self, id: i64) -> StoreResult<bool>;

    /// Move an action to `position` (clamped), shifting the others.
    async fn move_action(&self, id: i64, position: i32) -> StoreResult<Vec<SequenceAction>>;

    async fn set_action_sample(&self, id: i64, sample: Value) -> StoreResult<()>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, new: NewEvent) -> StoreResult<Event>;

    async fn get_event(&self, id: i64) -> StoreResult<Option<Event>>;
}

/// Persisted record of runs, their steps and logs.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// New `pending` run at attempt 1.
    async fn create_run(&self, new: NewRun) -> StoreResult<WorkflowRun>;

    async fn get_run(&self, id: i64) -> StoreResult<Option<WorkflowRun>>;

    /// Newest first.
    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<WorkflowRun>>;

    /// Move the run to `to` if its status is one of `from`. Clears `stale`,
    /// stamps `started_at` on the first start and `finished_at` on settling.
    async fn transition_run(
        &self,
        id: i64,
        from: &[RunStatus],
        to: RunStatus,
    ) -> StoreResult<Option<WorkflowRun>>;

    /// Open attempt `expected_attempt + 1` of a `failed` run: status
    /// `running`, empty output aggregate.
    async fn begin_attempt(&self, id: i64, expected_attempt: i32)
        -> StoreResult<Option<WorkflowRun>>;

    /// Record a step output in the aggregate if the run is still `running`
    /// at `attempt`. Returns whether it was recorded.
    async fn record_output(
        &self,
        id: i64,
        attempt: i32,
        position: i32,
        output: Value,
    ) -> StoreResult<bool>;

    /// Refresh `updated_at` of a running run.
    async fn touch_run(&self, id: i64) -> StoreResult<()>;

    /// Running, not yet flagged runs whose `updated_at` is older than `cutoff`.
    async fn find_stale_runs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<WorkflowRun>>;

    async fn mark_stale(&self, id: i64) -> StoreResult<bool>;

    async fn insert_step(&self, new: NewStep) -> StoreResult<WorkflowStep>;

    /// Finish a step, only while it is still `running`.
    async fn finish_step(
        &self,
        step_id: i64,
        status: StepStatus,
        outcome: StepOutcome,
    ) -> StoreResult<Option<WorkflowStep>>;

    /// Bump `retry_count` of a running step.
    async fn record_retry(&self, step_id: i64, error_message: &str) -> StoreResult<bool>;

    /// Fail every `running` step of the run with `AbortedError`.
    async fn abort_running_steps(&self, run_id: i64, message: &str) -> StoreResult<u64>;

    /// All attempts when `attempt` is `None`; ordered by attempt, position, id.
    async fn list_steps(&self, run_id: i64, attempt: Option<i32>) -> StoreResult<Vec<WorkflowStep>>;

    async fn append_log(&self, run_id: i64, level: LogLevel, message: &str) -> StoreResult<()>;

    async fn list_logs(&self, run_id: i64) -> StoreResult<Vec<RunLogEntry>>;
}

/// Everything the control plane persists.
#[async_trait]
pub trait Store: IntegrationStore + SequenceStore + EventStore + RunLedger {
    fn backend(&self) -> &'static str;

    async fn health_check(&self) -> bool;
}
