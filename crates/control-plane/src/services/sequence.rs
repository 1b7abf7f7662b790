//! Sequence configuration: triggers, ordered actions, available template
//! variables and the trigger/action test runs used while configuring.

use funnelflow_actions::{validate_configuration, Registry};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::models::{
    ActionCreateRequest, NewAction, NewSequence, NewTrigger, PositionVariables, Sequence,
    SequenceAction, SequenceCreateRequest, SequenceDetail, SequenceTrigger, StepStatus,
    TemplateVariable, TriggerCreateRequest, TriggerTestResponse, WorkflowStep,
};
use crate::engine::{ActionExecutor, ClientProvider, Conditions, IntegrationThrottle};
use crate::error::{AppError, AppResult};
use crate::inference;
use crate::store::Store;
use crate::template::{references, ResolutionContext, Root};

#[derive(Clone)]
pub struct SequenceService {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    clients: Arc<dyn ClientProvider>,
    executor: ActionExecutor,
    throttle: IntegrationThrottle,
    default_max_retries: i32,
}

impl SequenceService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        clients: Arc<dyn ClientProvider>,
        executor: ActionExecutor,
        throttle: IntegrationThrottle,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clients,
            executor,
            throttle,
            default_max_retries: i32::try_from(config.default_max_retries).unwrap_or(i32::MAX),
        }
    }

    async fn require_sequence(&self, id: i64) -> AppResult<Sequence> {
        self.store
            .get_sequence(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Sequence {id} not found")))
    }

    async fn require_trigger(&self, sequence_id: i64, trigger_id: i64) -> AppResult<SequenceTrigger> {
        self.store
            .get_trigger(trigger_id)
            .await?
            .filter(|t| t.sequence_id == sequence_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Trigger {trigger_id} not found in sequence {sequence_id}"
                ))
            })
    }

    async fn require_action(&self, sequence_id: i64, action_id: i64) -> AppResult<SequenceAction> {
        self.store
            .get_action(action_id)
            .await?
            .filter(|a| a.sequence_id == sequence_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Action {action_id} not found in sequence {sequence_id}"
                ))
            })
    }

    /// The integration must exist and belong to `app_key`.
    async fn check_integration(&self, integration_id: Option<i64>, app_key: &str) -> AppResult<()> {
        let Some(id) = integration_id else {
            return Ok(());
        };
        match self.store.get_integration(id).await? {
            Some(integration) if integration.app_key == app_key => Ok(()),
            Some(integration) => Err(AppError::Validation(format!(
                "Integration {id} belongs to '{}', not '{app_key}'",
                integration.app_key
            ))),
            None => Err(AppError::Validation(format!("Integration {id} does not exist"))),
        }
    }

    pub async fn create(&self, request: SequenceCreateRequest) -> AppResult<Sequence> {
        if request.name.trim().is_empty() {
            return Err(AppError::Validation("Sequence name is required".to_string()));
        }
        let sequence = self
            .store
            .create_sequence(NewSequence {
                tenant_id: request.tenant_id,
                name: request.name,
                enabled: request.enabled,
            })
            .await?;
        tracing::info!(sequence_id = sequence.id, "Sequence created");
        Ok(sequence)
    }

    pub async fn list(&self, tenant_id: Option<&str>) -> AppResult<Vec<Sequence>> {
        Ok(self.store.list_sequences(tenant_id).await?)
    }

    pub async fn get(&self, id: i64) -> AppResult<SequenceDetail> {
        let sequence = self.require_sequence(id).await?;
        let triggers = self.store.list_triggers(id).await?;
        let actions = self.store.list_actions(id).await?;
        Ok(SequenceDetail {
            sequence,
            triggers,
            actions,
        })
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> AppResult<Sequence> {
        let sequence = self
            .store
            .set_sequence_enabled(id, enabled)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Sequence {id} not found")))?;
        tracing::info!(sequence_id = id, enabled, "Sequence updated");
        Ok(sequence)
    }

    pub async fn delete(&self, id: i64) -> AppResult<()> {
        if !self.store.delete_sequence(id).await? {
            return Err(AppError::NotFound(format!("Sequence {id} not found")));
        }
        tracing::info!(sequence_id = id, "Sequence deleted");
        Ok(())
    }

    /// Add a trigger. Its configuration is validated against the trigger
    /// kind's schema and may not contain template expressions.
    pub async fn add_trigger(
        &self,
        sequence_id: i64,
        request: TriggerCreateRequest,
    ) -> AppResult<SequenceTrigger> {
        self.require_sequence(sequence_id).await?;
        let kind = self
            .registry
            .trigger(&request.app_key, &request.trigger_key)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Unknown trigger '{}.{}'",
                    request.app_key, request.trigger_key
                ))
            })?;

        let configuration = request.configuration.unwrap_or_else(|| json!({}));
        let validated = validate_configuration(&kind.props(), &configuration)?;
        if let Some((key, _)) = validated.iter().find(|(_, v)| v.has_template()) {
            return Err(AppError::Validation(format!(
                "Trigger field '{key}' cannot contain template expressions"
            )));
        }

        let conditions = request.conditions.filter(|c| !c.is_null());
        if let Some(raw) = &conditions {
            Conditions::parse(raw)?;
        }
        self.check_integration(request.integration_id, &request.app_key)
            .await?;

        let trigger = self
            .store
            .create_trigger(NewTrigger {
                sequence_id,
                app_key: request.app_key,
                integration_id: request.integration_id,
                trigger_key: request.trigger_key,
                configuration,
                conditions,
            })
            .await?;
        tracing::info!(sequence_id, trigger_id = trigger.id, "Trigger added");
        Ok(trigger)
    }

    pub async fn delete_trigger(&self, sequence_id: i64, trigger_id: i64) -> AppResult<()> {
        self.require_trigger(sequence_id, trigger_id).await?;
        self.store.delete_trigger(trigger_id).await?;
        tracing::info!(sequence_id, trigger_id, "Trigger deleted");
        Ok(())
    }

    /// Add an action at `request.position` (appended when unset). Every
    /// template reference must name the trigger or an earlier action and a
    /// path known from their samples.
    pub async fn add_action(
        &self,
        sequence_id: i64,
        request: ActionCreateRequest,
    ) -> AppResult<SequenceAction> {
        self.require_sequence(sequence_id).await?;
        let definition = self
            .registry
            .action(&request.app_key, &request.action_key)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Unknown action '{}.{}'",
                    request.app_key, request.action_key
                ))
            })?;

        let configuration = request.configuration.unwrap_or_else(|| json!({}));
        validate_configuration(&definition.props(), &configuration)?;

        let max_retries = request.max_retries.unwrap_or(self.default_max_retries);
        if max_retries < 0 {
            return Err(AppError::Validation(
                "max_retries cannot be negative".to_string(),
            ));
        }
        self.check_integration(request.integration_id, &request.app_key)
            .await?;

        let triggers = self.store.list_triggers(sequence_id).await?;
        let actions = self.store.list_actions(sequence_id).await?;
        let count = actions.len() as i32;
        let position = request.position.map_or(count + 1, |p| p.clamp(1, count + 1));
        let variables = self.variables_at(&triggers, &actions, position);
        validate_references(&configuration, position, &variables)?;

        let action = self
            .store
            .insert_action(NewAction {
                sequence_id,
                position: Some(position),
                name: request
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| definition.label().to_string()),
                app_key: request.app_key,
                integration_id: request.integration_id,
                action_key: request.action_key,
                configuration,
                max_retries,
                enabled: request.enabled,
            })
            .await?;
        tracing::info!(sequence_id, action_id = action.id, position = action.position, "Action added");
        Ok(action)
    }

    /// Delete an action; later actions move up one position.
    pub async fn delete_action(&self, sequence_id: i64, action_id: i64) -> AppResult<Vec<SequenceAction>> {
        self.require_action(sequence_id, action_id).await?;
        self.store.delete_action(action_id).await?;
        tracing::info!(sequence_id, action_id, "Action deleted");
        Ok(self.store.list_actions(sequence_id).await?)
    }

    pub async fn move_action(
        &self,
        sequence_id: i64,
        action_id: i64,
        position: i32,
    ) -> AppResult<Vec<SequenceAction>> {
        self.require_action(sequence_id, action_id).await?;
        let actions = self.store.move_action(action_id, position).await?;
        tracing::info!(sequence_id, action_id, position, "Action moved");
        Ok(actions)
    }

    /// Variables available to every action of the sequence.
    pub async fn variables(&self, sequence_id: i64) -> AppResult<Vec<PositionVariables>> {
        self.require_sequence(sequence_id).await?;
        let triggers = self.store.list_triggers(sequence_id).await?;
        let actions = self.store.list_actions(sequence_id).await?;
        Ok(actions
            .iter()
            .map(|action| PositionVariables {
                position: action.position,
                action_id: action.id,
                variables: self.variables_at(&triggers, &actions, action.position),
            })
            .collect())
    }

    fn trigger_sample(&self, trigger: &SequenceTrigger) -> Value {
        trigger
            .sample_output
            .clone()
            .or_else(|| {
                self.registry
                    .trigger(&trigger.app_key, &trigger.trigger_key)
                    .map(|kind| kind.sample())
            })
            .unwrap_or_else(|| json!({}))
    }

    fn action_sample(&self, action: &SequenceAction) -> Value {
        action
            .sample_output
            .clone()
            .or_else(|| {
                self.registry
                    .action(&action.app_key, &action.action_key)
                    .map(|definition| definition.sample())
            })
            .unwrap_or_else(|| json!({}))
    }

    fn variables_at(
        &self,
        triggers: &[SequenceTrigger],
        actions: &[SequenceAction],
        position: i32,
    ) -> Vec<TemplateVariable> {
        let mut variables = Vec::new();
        for trigger in triggers {
            let sample = self.trigger_sample(trigger);
            for variable in inference::available_variables(Some(&sample), &[]) {
                if !variables.contains(&variable) {
                    variables.push(variable);
                }
            }
        }

        let samples: Vec<(i32, Value)> = actions
            .iter()
            .filter(|a| a.position < position)
            .map(|a| (a.position, self.action_sample(a)))
            .collect();
        let earlier: Vec<(i32, &Value)> = samples.iter().map(|(p, v)| (*p, v)).collect();
        variables.extend(inference::available_variables(None, &earlier));
        variables
    }

    /// Run the trigger kind's test against its integration and keep the
    /// payload as the trigger's sample.
    pub async fn test_trigger(&self, sequence_id: i64, trigger_id: i64) -> AppResult<TriggerTestResponse> {
        let trigger = self.require_trigger(sequence_id, trigger_id).await?;
        let kind = self
            .registry
            .require_trigger(&trigger.app_key, &trigger.trigger_key)?;

        let integration = match trigger.integration_id {
            Some(id) => self.store.get_integration(id).await?,
            None => None,
        };
        let client = match &integration {
            Some(i) if i.is_active() => Some(self.clients.client(i).await?),
            Some(i) if kind.requires_auth() => {
                return Err(AppError::Auth(format!(
                    "Integration {} is {}; reconnect it before testing",
                    i.id,
                    i.state.as_str()
                )))
            }
            None if kind.requires_auth() => {
                return Err(AppError::Auth(format!(
                    "Connect an integration for '{}' before testing",
                    trigger.app_key
                )))
            }
            _ => None,
        };

        let empty = Map::new();
        let config = trigger.configuration.as_object().unwrap_or(&empty);
        let sample = self
            .throttle
            .run(trigger.integration_id, kind.test(config, client.as_deref()))
            .await?;

        self.store.set_trigger_sample(trigger.id, sample.clone()).await?;
        tracing::info!(sequence_id, trigger_id, "Trigger tested, sample stored");

        Ok(TriggerTestResponse {
            trigger_id: trigger.id,
            schema: inference::infer(&sample),
            variables: inference::available_variables(Some(&sample), &[]),
            sample,
        })
    }

    /// Execute the action once against the samples of the trigger and the
    /// earlier actions, without creating a run. A successful output becomes
    /// the action's sample.
    pub async fn test_action(&self, sequence_id: i64, action_id: i64) -> AppResult<WorkflowStep> {
        let action = self.require_action(sequence_id, action_id).await?;
        let triggers = self.store.list_triggers(sequence_id).await?;
        let actions = self.store.list_actions(sequence_id).await?;

        let trigger_sample = triggers
            .first()
            .map(|t| self.trigger_sample(t))
            .unwrap_or_else(|| json!({}));
        let mut ctx = ResolutionContext::new(trigger_sample);
        for earlier in actions.iter().filter(|a| a.position < action.position) {
            ctx.record_step(earlier.position, self.action_sample(earlier));
        }

        let mut preview = action.clone();
        preview.enabled = true;
        preview.max_retries = 0;
        let step = self.executor.preview_step(&preview, &mut ctx).await?;

        if let (StepStatus::Completed, Some(output)) = (step.status, &step.output_data) {
            self.store.set_action_sample(action.id, output.clone()).await?;
        }
        tracing::info!(sequence_id, action_id, status = %step.status, "Action tested");
        Ok(step)
    }
}

/// Reject references that cannot resolve at `position`.
fn validate_references(
    configuration: &Value,
    position: i32,
    variables: &[TemplateVariable],
) -> AppResult<()> {
    let found = references(configuration).map_err(|e| AppError::Validation(e.to_string()))?;
    for expression in found {
        if let Root::Step(step) = expression.root {
            if step >= position {
                return Err(AppError::Validation(format!(
                    "'{}' refers to step {step}, which does not run before position {position}",
                    expression.source
                )));
            }
        }
        let name = expression.variable();
        if !expression.has_default() && !inference::is_known_variable(variables, &name) {
            return Err(AppError::Validation(format!(
                "Unknown variable '{name}' in '{}'",
                expression.source
            )));
        }
    }
    Ok(())
}
