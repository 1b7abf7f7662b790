//! PostgreSQL store backed by the queries in [`crate::db::queries`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{EventStore, IntegrationStore, RunLedger, SequenceStore, Store, StoreResult};
use crate::db::models::{
    Event, Integration, IntegrationState, LogLevel, NewAction, NewEvent, NewIntegration, NewRun,
    NewSequence, NewStep, NewTrigger, RunFilter, RunLogEntry, RunStatus, Sequence, SequenceAction,
    SequenceTrigger, StepOutcome, StepStatus, WorkflowRun, WorkflowStep,
};
use crate::db::queries::{event, integration, sequence, workflow};
use crate::db::{pool, DbPool};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl IntegrationStore for PgStore {
    async fn create_integration(&self, new: NewIntegration) -> StoreResult<Integration> {
        integration::insert_integration(&self.pool, new).await
    }

    async fn get_integration(&self, id: i64) -> StoreResult<Option<Integration>> {
        integration::get_integration(&self.pool, id).await
    }

    async fn list_integrations(&self, tenant_id: Option<&str>) -> StoreResult<Vec<Integration>> {
        integration::list_integrations(&self.pool, tenant_id).await
    }

    async fn delete_integration(&self, id: i64) -> StoreResult<bool> {
        integration::delete_integration(&self.pool, id).await
    }

    async fn set_integration_state(
        &self,
        id: i64,
        state: IntegrationState,
        message: Option<String>,
        tested: bool,
    ) -> StoreResult<Option<Integration>> {
        integration::update_state(&self.pool, id, state, message.as_deref(), tested).await
    }
}

#[async_trait]
impl SequenceStore for PgStore {
    async fn create_sequence(&self, new: NewSequence) -> StoreResult<Sequence> {
        sequence::insert_sequence(&self.pool, new).await
    }

    async fn get_sequence(&self, id: i64) -> StoreResult<Option<Sequence>> {
        sequence::get_sequence(&self.pool, id).await
    }

    async fn list_sequences(&self, tenant_id: Option<&str>) -> StoreResult<Vec<Sequence>> {
        sequence::list_sequences(&self.pool, tenant_id).await
    }

    async fn set_sequence_enabled(&self, id: i64, enabled: bool) -> StoreResult<Option<Sequence>> {
        sequence::set_sequence_enabled(&self.pool, id, enabled).await
    }

    async fn delete_sequence(&self, id: i64) -> StoreResult<bool> {
        sequence::delete_sequence(&self.pool, id).await
    }

    async fn create_trigger(&self, new: NewTrigger) -> StoreResult<SequenceTrigger> {
        sequence::insert_trigger(&self.pool, new).await
    }

    async fn get_trigger(&self, id: i64) -> StoreResult<Option<SequenceTrigger>> {
        sequence::get_trigger(&self.pool, id).await
    }

    async fn list_triggers(&self, sequence_id: i64) -> StoreResult<Vec<SequenceTrigger>> {
        sequence::list_triggers(&self.pool, sequence_id).await
    }

    async fn find_triggers(
        &self,
        app_key: &str,
        trigger_key: &str,
    ) -> StoreResult<Vec<SequenceTrigger>> {
        sequence::find_triggers(&self.pool, app_key, trigger_key).await
    }

    async fn delete_trigger(&self, id: i64) -> StoreResult<bool> {
        sequence::delete_trigger(&self.pool, id).await
    }

    async fn set_trigger_sample(&self, id: i64, sample: Value) -> StoreResult<()> {
        sequence::set_trigger_sample(&self.pool, id, &sample).await
    }

    async fn insert_action(&self, new: NewAction) -> StoreResult<SequenceAction> {
        sequence::insert_action(&self.pool, new).await
    }

    async fn get_action(&self, id: i64) -> StoreResult<Option<SequenceAction>> {
        sequence::get_action(&self.pool, id).await
    }

    async fn list_actions(&self, sequence_id: i64) -> StoreResult<Vec<SequenceAction>> {
        sequence::list_actions(&self.pool, sequence_id).await
    }

    async fn delete_action(&self, id: i64) -> StoreResult<bool> {
        sequence::delete_action(&self.pool, id).await
    }

    async fn move_action(&self, id: i64, position: i32) -> StoreResult<Vec<SequenceAction>> {
        sequence::move_action(&self.pool, id, position).await
    }

    async fn set_action_sample(&self, id: i64, sample: Value) -> StoreResult<()> {
        sequence::set_action_sample(&self.pool, id, &sample).await
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event(&self, new: NewEvent) -> StoreResult<Event> {
        event::insert_event(&self.pool, new).await
    }

    async fn get_event(&self, id: i64) -> StoreResult<Option<Event>> {
        event::get_event(&self.pool, id).await
    }
}

#[async_trait]
impl RunLedger for PgStore {
    async fn create_run(&self, new: NewRun) -> StoreResult<WorkflowRun> {
        workflow::insert_run(&self.pool, new).await
    }

    async fn get_run(&self, id: i64) -> StoreResult<Option<WorkflowRun>> {
        workflow::get_run(&self.pool, id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<WorkflowRun>> {
        workflow::list_runs(&self.pool, filter).await
    }

    async fn transition_run(
        &self,
        id: i64,
        from: &[RunStatus],
        to: RunStatus,
    ) -> StoreResult<Option<WorkflowRun>> {
        workflow::transition_run(&self.pool, id, from, to).await
    }

    async fn begin_attempt(
        &self,
        id: i64,
        expected_attempt: i32,
    ) -> StoreResult<Option<WorkflowRun>> {
        workflow::begin_attempt(&self.pool, id, expected_attempt).await
    }

    async fn record_output(
        &self,
        id: i64,
        attempt: i32,
        position: i32,
        output: Value,
    ) -> StoreResult<bool> {
        workflow::record_output(&self.pool, id, attempt, position, &output).await
    }

    async fn touch_run(&self, id: i64) -> StoreResult<()> {
        workflow::touch_run(&self.pool, id).await
    }

    async fn find_stale_runs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<WorkflowRun>> {
        workflow::find_stale_runs(&self.pool, cutoff).await
    }

    async fn mark_stale(&self, id: i64) -> StoreResult<bool> {
        workflow::mark_stale(&self.pool, id).await
    }

    async fn insert_step(&self, new: NewStep) -> StoreResult<WorkflowStep> {
        workflow::insert_step(&self.pool, new).await
    }

    async fn finish_step(
        &self,
        step_id: i64,
        status: StepStatus,
        outcome: StepOutcome,
    ) -> StoreResult<Option<WorkflowStep>> {
        workflow::finish_step(&self.pool, step_id, status, outcome).await
    }

    async fn record_retry(&self, step_id: i64, error_message: &str) -> StoreResult<bool> {
        workflow::record_retry(&self.pool, step_id, error_message).await
    }

    async fn abort_running_steps(&self, run_id: i64, message: &str) -> StoreResult<u64> {
        workflow::abort_running_steps(&self.pool, run_id, message).await
    }

    async fn list_steps(&self, run_id: i64, attempt: Option<i32>) -> StoreResult<Vec<WorkflowStep>> {
        workflow::list_steps(&self.pool, run_id, attempt).await
    }

    async fn append_log(&self, run_id: i64, level: LogLevel, message: &str) -> StoreResult<()> {
        workflow::append_log(&self.pool, run_id, level, message).await
    }

    async fn list_logs(&self, run_id: i64) -> StoreResult<Vec<RunLogEntry>> {
        workflow::list_logs(&self.pool, run_id).await
    }
}

#[async_trait]
impl Store for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn health_check(&self) -> bool {
        pool::health_check(&self.pool).await
    }
}
