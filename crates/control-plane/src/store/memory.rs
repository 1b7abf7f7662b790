//! In-process store for tests and single-node runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funnelflow_actions::ErrorCode;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    EventStore, IntegrationStore, RunLedger, SequenceStore, Store, StoreError, StoreResult,
};
use crate::db::models::{
    merge_output, Event, Integration, IntegrationState, LogLevel, NewAction, NewEvent,
    NewIntegration, NewRun, NewSequence, NewStep, NewTrigger, RunFilter, RunLogEntry, RunStatus,
    Sequence, SequenceAction, SequenceTrigger, StepOutcome, StepStatus, WorkflowRun, WorkflowStep,
};

#[derive(Default)]
struct State {
    next_id: i64,
    integrations: BTreeMap<i64, Integration>,
    sequences: BTreeMap<i64, Sequence>,
    triggers: BTreeMap<i64, SequenceTrigger>,
    actions: BTreeMap<i64, SequenceAction>,
    events: BTreeMap<i64, Event>,
    runs: BTreeMap<i64, WorkflowRun>,
    steps: BTreeMap<i64, WorkflowStep>,
    logs: Vec<RunLogEntry>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn sequence_actions(&self, sequence_id: i64) -> Vec<SequenceAction> {
        let mut actions: Vec<_> = self
            .actions
            .values()
            .filter(|a| a.sequence_id == sequence_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| (a.position, a.id));
        actions
    }

    /// Rewrite positions of a sequence from an ordered id list.
    fn renumber(&mut self, ordered: &[i64]) {
        let now = Utc::now();
        for (index, id) in ordered.iter().enumerate() {
            if let Some(action) = self.actions.get_mut(id) {
                let position = index as i32 + 1;
                if action.position != position {
                    action.position = position;
                    action.updated_at = now;
                }
            }
        }
    }
}

/// Store keeping everything in one mutex-guarded map set.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl IntegrationStore for MemoryStore {
    async fn create_integration(&self, new: NewIntegration) -> StoreResult<Integration> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let integration = Integration {
            id: state.id(),
            tenant_id: new.tenant_id,
            app_key: new.app_key,
            name: new.name,
            credentials: new.credentials,
            config: new.config,
            state: IntegrationState::Created,
            last_message: None,
            last_tested_at: None,
            created_at: now,
            updated_at: now,
        };
        state.integrations.insert(integration.id, integration.clone());
        Ok(integration)
    }

    async fn get_integration(&self, id: i64) -> StoreResult<Option<Integration>> {
        Ok(self.lock()?.integrations.get(&id).cloned())
    }

    async fn list_integrations(&self, tenant_id: Option<&str>) -> StoreResult<Vec<Integration>> {
        Ok(self
            .lock()?
            .integrations
            .values()
            .filter(|i| tenant_id.map_or(true, |t| i.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn delete_integration(&self, id: i64) -> StoreResult<bool> {
        Ok(self.lock()?.integrations.remove(&id).is_some())
    }

    async fn set_integration_state(
        &self,
        id: i64,
        new_state: IntegrationState,
        message: Option<String>,
        tested: bool,
    ) -> StoreResult<Option<Integration>> {
        let mut state = self.lock()?;
        let Some(integration) = state.integrations.get_mut(&id) else {
            return Ok(None);
        };
        let now = Utc::now();
        integration.state = new_state;
        integration.last_message = message;
        if tested {
            integration.last_tested_at = Some(now);
        }
        integration.updated_at = now;
        Ok(Some(integration.clone()))
    }
}

#[async_trait]
impl SequenceStore for MemoryStore {
    async fn create_sequence(&self, new: NewSequence) -> StoreResult<Sequence> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let sequence = Sequence {
            id: state.id(),
            tenant_id: new.tenant_id,
            name: new.name,
            enabled: new.enabled,
            created_at: now,
            updated_at: now,
        };
        state.sequences.insert(sequence.id, sequence.clone());
        Ok(sequence)
    }

    async fn get_sequence(&self, id: i64) -> StoreResult<Option<Sequence>> {
        Ok(self.lock()?.sequences.get(&id).cloned())
    }

    async fn list_sequences(&self, tenant_id: Option<&str>) -> StoreResult<Vec<Sequence>> {
        Ok(self
            .lock()?
            .sequences
            .values()
            .filter(|s| tenant_id.map_or(true, |t| s.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn set_sequence_enabled(&self, id: i64, enabled: bool) -> StoreResult<Option<Sequence>> {
        let mut state = self.lock()?;
        Ok(state.sequences.get_mut(&id).map(|s| {
            s.enabled = enabled;
            s.updated_at = Utc::now();
            s.clone()
        }))
    }

    async fn delete_sequence(&self, id: i64) -> StoreResult<bool> {
        let mut state = self.lock()?;
        state.triggers.retain(|_, t| t.sequence_id != id);
        state.actions.retain(|_, a| a.sequence_id != id);
        Ok(state.sequences.remove(&id).is_some())
    }

    async fn create_trigger(&self, new: NewTrigger) -> StoreResult<SequenceTrigger> {
        let mut state = self.lock()?;
        if !state.sequences.contains_key(&new.sequence_id) {
            return Err(StoreError::NotFound(format!("sequence {}", new.sequence_id)));
        }
        let trigger = SequenceTrigger {
            id: state.id(),
            sequence_id: new.sequence_id,
            app_key: new.app_key,
            integration_id: new.integration_id,
            trigger_key: new.trigger_key,
            configuration: new.configuration,
            conditions: new.conditions,
            sample_output: None,
            created_at: Utc::now(),
        };
        state.triggers.insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn get_trigger(&self, id: i64) -> StoreResult<Option<SequenceTrigger>> {
        Ok(self.lock()?.triggers.get(&id).cloned())
    }

    async fn list_triggers(&self, sequence_id: i64) -> StoreResult<Vec<SequenceTrigger>> {
        Ok(self
            .lock()?
            .triggers
            .values()
            .filter(|t| t.sequence_id == sequence_id)
            .cloned()
            .collect())
    }

    async fn find_triggers(
        &self,
        app_key: &str,
        trigger_key: &str,
    ) -> StoreResult<Vec<SequenceTrigger>> {
        Ok(self
            .lock()?
            .triggers
            .values()
            .filter(|t| t.app_key == app_key && t.trigger_key == trigger_key)
            .cloned()
            .collect())
    }

    async fn delete_trigger(&self, id: i64) -> StoreResult<bool> {
        Ok(self.lock()?.triggers.remove(&id).is_some())
    }

    async fn set_trigger_sample(&self, id: i64, sample: Value) -> StoreResult<()> {
        let mut state = self.lock()?;
        let trigger = state
            .triggers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("trigger {id}")))?;
        trigger.sample_output = Some(sample);
        Ok(())
    }

    async fn insert_action(&self, new: NewAction) -> StoreResult<SequenceAction> {
        let mut state = self.lock()?;
        if !state.sequences.contains_key(&new.sequence_id) {
            return Err(StoreError::NotFound(format!("sequence {}", new.sequence_id)));
        }
        let mut ordered: Vec<i64> = state
            .sequence_actions(new.sequence_id)
            .iter()
            .map(|a| a.id)
            .collect();
        let index = new
            .position
            .map(|p| (p.max(1) as usize - 1).min(ordered.len()))
            .unwrap_or(ordered.len());

        let now = Utc::now();
        let action = SequenceAction {
            id: state.id(),
            sequence_id: new.sequence_id,
            position: index as i32 + 1,
            name: new.name,
            app_key: new.app_key,
            integration_id: new.integration_id,
            action_key: new.action_key,
            configuration: new.configuration,
            max_retries: new.max_retries,
            enabled: new.enabled,
            sample_output: None,
            created_at: now,
            updated_at: now,
        };
        let id = action.id;
        state.actions.insert(id, action);
        ordered.insert(index, id);
        state.renumber(&ordered);
        state
            .actions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("action {id}")))
    }

    async fn get_action(&self, id: i64) -> StoreResult<Option<SequenceAction>> {
        Ok(self.lock()?.actions.get(&id).cloned())
    }

    async fn list_actions(&self, sequence_id: i64) -> StoreResult<Vec<SequenceAction>> {
        Ok(self.lock()?.sequence_actions(sequence_id))
    }

    async fn delete_action(&self, id: i64) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some(removed) = state.actions.remove(&id) else {
            return Ok(false);
        };
        let ordered: Vec<i64> = state
            .sequence_actions(removed.sequence_id)
            .iter()
            .map(|a| a.id)
            .collect();
        state.renumber(&ordered);
        Ok(true)
    }

    async fn move_action(&self, id: i64, position: i32) -> StoreResult<Vec<SequenceAction>> {
        let mut state = self.lock()?;
        let sequence_id = state
            .actions
            .get(&id)
            .map(|a| a.sequence_id)
            .ok_or_else(|| StoreError::NotFound(format!("action {id}")))?;
        let mut ordered: Vec<i64> = state
            .sequence_actions(sequence_id)
            .iter()
            .map(|a| a.id)
            .filter(|other| *other != id)
            .collect();
        let index = (position.max(1) as usize - 1).min(ordered.len());
        ordered.insert(index, id);
        state.renumber(&ordered);
        Ok(state.sequence_actions(sequence_id))
    }

    async fn set_action_sample(&self, id: i64, sample: Value) -> StoreResult<()> {
        let mut state = self.lock()?;
        let action = state
            .actions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("action {id}")))?;
        action.sample_output = Some(sample);
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, new: NewEvent) -> StoreResult<Event> {
        let mut state = self.lock()?;
        let event = Event {
            id: state.id(),
            app_key: new.app_key,
            trigger_key: new.trigger_key,
            integration_id: new.integration_id,
            event_data: new.event_data,
            created_at: Utc::now(),
        };
        state.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn get_event(&self, id: i64) -> StoreResult<Option<Event>> {
        Ok(self.lock()?.events.get(&id).cloned())
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn create_run(&self, new: NewRun) -> StoreResult<WorkflowRun> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let run = WorkflowRun {
            id: state.id(),
            sequence_id: new.sequence_id,
            trigger_id: new.trigger_id,
            event_id: new.event_id,
            status: RunStatus::Pending,
            attempt: 1,
            arguments: new.arguments,
            output: json!({}),
            stale: false,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: i64) -> StoreResult<Option<WorkflowRun>> {
        Ok(self.lock()?.runs.get(&id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<WorkflowRun>> {
        let state = self.lock()?;
        Ok(state
            .runs
            .values()
            .rev()
            .filter(|r| filter.sequence_id.map_or(true, |s| r.sequence_id == s))
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn transition_run(
        &self,
        id: i64,
        from: &[RunStatus],
        to: RunStatus,
    ) -> StoreResult<Option<WorkflowRun>> {
        let mut state = self.lock()?;
        let Some(run) = state.runs.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&run.status) {
            return Ok(None);
        }
        let now = Utc::now();
        run.status = to;
        run.stale = false;
        run.updated_at = now;
        if to == RunStatus::Running {
            run.started_at.get_or_insert(now);
            run.finished_at = None;
        } else if to.is_settled() {
            run.finished_at = Some(now);
        }
        Ok(Some(run.clone()))
    }

    async fn begin_attempt(
        &self,
        id: i64,
        expected_attempt: i32,
    ) -> StoreResult<Option<WorkflowRun>> {
        let mut state = self.lock()?;
        let Some(run) = state.runs.get_mut(&id) else {
            return Ok(None);
        };
        if run.status != RunStatus::Failed || run.attempt != expected_attempt {
            return Ok(None);
        }
        let now = Utc::now();
        run.attempt += 1;
        run.status = RunStatus::Running;
        run.output = json!({});
        run.stale = false;
        run.finished_at = None;
        run.started_at = Some(now);
        run.updated_at = now;
        Ok(Some(run.clone()))
    }

    async fn record_output(
        &self,
        id: i64,
        attempt: i32,
        position: i32,
        output: Value,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some(run) = state.runs.get_mut(&id) else {
            return Ok(false);
        };
        if run.attempt != attempt || run.status != RunStatus::Running {
            return Ok(false);
        }
        run.output = merge_output(&run.output, position, output);
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn touch_run(&self, id: i64) -> StoreResult<()> {
        let mut state = self.lock()?;
        if let Some(run) = state.runs.get_mut(&id) {
            if run.status == RunStatus::Running {
                run.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn find_stale_runs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<WorkflowRun>> {
        Ok(self
            .lock()?
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running && !r.stale && r.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn mark_stale(&self, id: i64) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Running && !run.stale => {
                run.stale = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_step(&self, new: NewStep) -> StoreResult<WorkflowStep> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let settled = new.status.is_terminal();
        let step = WorkflowStep {
            id: state.id(),
            run_id: new.run_id,
            attempt: new.attempt,
            node_id: new.node_id,
            node_name: new.node_name,
            node_type: new.node_type,
            position: new.position,
            status: new.status,
            input_data: new.input_data,
            output_data: None,
            raw_response: None,
            processed_output: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            debug_info: new.debug_info,
            started_at: now,
            completed_at: settled.then_some(now),
            duration_ms: settled.then_some(0),
        };
        state.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn finish_step(
        &self,
        step_id: i64,
        status: StepStatus,
        outcome: StepOutcome,
    ) -> StoreResult<Option<WorkflowStep>> {
        let mut state = self.lock()?;
        let Some(step) = state.steps.get_mut(&step_id) else {
            return Ok(None);
        };
        if step.status != StepStatus::Running {
            return Ok(None);
        }
        let now = Utc::now();
        step.status = status;
        step.output_data = outcome.output_data;
        step.raw_response = outcome.raw_response;
        step.processed_output = outcome.processed_output;
        step.error_message = outcome.error_message;
        step.error_code = outcome.error_code;
        if let Some(debug_info) = outcome.debug_info {
            step.debug_info = debug_info;
        }
        step.completed_at = Some(now);
        step.duration_ms = Some((now - step.started_at).num_milliseconds());
        Ok(Some(step.clone()))
    }

    async fn record_retry(&self, step_id: i64, error_message: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.steps.get_mut(&step_id) {
            Some(step) if step.status == StepStatus::Running => {
                step.retry_count += 1;
                step.error_message = Some(error_message.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn abort_running_steps(&self, run_id: i64, message: &str) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut aborted = 0;
        for step in state.steps.values_mut() {
            if step.run_id == run_id && step.status == StepStatus::Running {
                step.status = StepStatus::Failed;
                step.error_code = Some(ErrorCode::AbortedError);
                step.error_message = Some(message.to_string());
                step.completed_at = Some(now);
                step.duration_ms = Some((now - step.started_at).num_milliseconds());
                aborted += 1;
            }
        }
        Ok(aborted)
    }

    async fn list_steps(&self, run_id: i64, attempt: Option<i32>) -> StoreResult<Vec<WorkflowStep>> {
        let state = self.lock()?;
        let mut steps: Vec<_> = state
            .steps
            .values()
            .filter(|s| s.run_id == run_id && attempt.map_or(true, |a| s.attempt == a))
            .cloned()
            .collect();
        steps.sort_by_key(|s| (s.attempt, s.position, s.id));
        Ok(steps)
    }

    async fn append_log(&self, run_id: i64, level: LogLevel, message: &str) -> StoreResult<()> {
        let mut state = self.lock()?;
        let entry = RunLogEntry {
            id: state.id(),
            run_id,
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        state.logs.push(entry);
        Ok(())
    }

    async fn list_logs(&self, run_id: i64) -> StoreResult<Vec<RunLogEntry>> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> bool {
        self.lock().is_ok()
    }
}
