//! Execution of one action as one workflow step.
//!
//! A step goes through dispatch (schema validation, template resolution,
//! type coercion, auth precondition) and invocation (throttle, timeout,
//! retry). Failures before invocation settle the step immediately; the
//! invocation result is written with a conditional update so a step that
//! was aborted in the meantime is never overwritten.

use chrono::Utc;
use funnelflow_actions::{
    validate_configuration, Action, ActionError, ActionOutput, ErrorCode, IntegrationClient,
    Registry,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::clients::ClientProvider;
use super::retry::RetryPolicy;
use super::throttle::IntegrationThrottle;
use crate::db::models::{
    NewStep, RunStatus, SequenceAction, StepOutcome, StepStatus, WorkflowRun, WorkflowStep,
};
use crate::inference;
use crate::sanitize::redact;
use crate::store::{Store, StoreResult};
use crate::template::ResolutionContext;

/// Arguments ready for invocation.
struct Prepared {
    action: Arc<dyn Action>,
    args: Map<String, Value>,
    client: Option<Arc<dyn IntegrationClient>>,
    integration_id: Option<i64>,
}

/// Result of dispatch.
enum Dispatch {
    Ready(Prepared),
    /// Settled without invoking anything.
    Settled {
        status: StepStatus,
        input: Value,
        outcome: StepOutcome,
    },
}

/// Result of invocation.
struct Invocation {
    status: StepStatus,
    outcome: StepOutcome,
    output: Option<Value>,
}

/// Identifies the persisted row an invocation belongs to.
struct StepGuard {
    step_id: i64,
    run_id: i64,
    attempt: i32,
}

/// What happened to a step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: WorkflowStep,
    /// The run moved on (cancel, force-rerun) while the step was in flight;
    /// its result was not recorded.
    pub superseded: bool,
}

#[derive(Clone)]
pub struct ActionExecutor {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    clients: Arc<dyn ClientProvider>,
    throttle: IntegrationThrottle,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        clients: Arc<dyn ClientProvider>,
        throttle: IntegrationThrottle,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            clients,
            throttle,
            retry,
            timeout,
        }
    }

    /// Execute `action` for `run` and persist its step row. On success the
    /// output is added to the run aggregate and to `ctx`.
    pub async fn execute_step(
        &self,
        run: &WorkflowRun,
        action: &SequenceAction,
        ctx: &mut ResolutionContext,
    ) -> StoreResult<StepReport> {
        let new_step = |status: StepStatus, input: Value, debug_info: Value| NewStep {
            run_id: run.id,
            attempt: run.attempt,
            node_id: action.id,
            node_name: action.name.clone(),
            node_type: action.node_type(),
            position: action.position,
            status,
            input_data: input,
            debug_info,
        };

        if !action.enabled {
            let step = self
                .store
                .insert_step(new_step(
                    StepStatus::Skipped,
                    redact(&action.configuration),
                    json!({"reason": "Action disabled"}),
                ))
                .await?;
            return Ok(StepReport {
                step,
                superseded: false,
            });
        }

        let prepared = match self.dispatch(action, ctx).await? {
            Dispatch::Ready(prepared) => prepared,
            Dispatch::Settled {
                status,
                input,
                outcome,
            } => {
                tracing::warn!(
                    run_id = run.id,
                    position = action.position,
                    status = %status,
                    error = outcome.error_message.as_deref().unwrap_or_default(),
                    "Step settled at dispatch"
                );
                let inserted = self
                    .store
                    .insert_step(new_step(StepStatus::Running, input, json!({})))
                    .await?;
                if let Some(report) = self.abort_if_moved_on(run, &inserted).await? {
                    return Ok(report);
                }
                return Ok(match self.store.finish_step(inserted.id, status, outcome).await? {
                    Some(step) => StepReport {
                        step,
                        superseded: false,
                    },
                    None => StepReport {
                        step: inserted,
                        superseded: true,
                    },
                });
            }
        };

        let step = self
            .store
            .insert_step(new_step(
                StepStatus::Running,
                redact(&Value::Object(prepared.args.clone())),
                json!({"integration_id": prepared.integration_id}),
            ))
            .await?;

        tracing::info!(
            run_id = run.id,
            step_id = step.id,
            position = action.position,
            node_type = %step.node_type,
            "Dispatching action"
        );

        if let Some(report) = self.abort_if_moved_on(run, &step).await? {
            return Ok(report);
        }

        let guard = StepGuard {
            step_id: step.id,
            run_id: run.id,
            attempt: run.attempt,
        };
        let max_retries = u32::try_from(action.max_retries).unwrap_or(0);
        let invocation = self.invoke(&prepared, max_retries, Some(&guard)).await?;

        let status = invocation.status;
        let Some(finished) = self
            .store
            .finish_step(step.id, status, invocation.outcome)
            .await?
        else {
            tracing::warn!(run_id = run.id, step_id = step.id, "Step was aborted while in flight");
            return Ok(StepReport {
                step,
                superseded: true,
            });
        };

        if let (StepStatus::Completed, Some(output)) = (status, invocation.output) {
            let recorded = self
                .store
                .record_output(run.id, run.attempt, action.position, output.clone())
                .await?;
            if !recorded {
                tracing::warn!(
                    run_id = run.id,
                    step_id = finished.id,
                    "Run moved on while step was in flight, output discarded"
                );
                return Ok(StepReport {
                    step: finished,
                    superseded: true,
                });
            }
            ctx.record_step(action.position, output);
        }

        Ok(StepReport {
            step: finished,
            superseded: false,
        })
    }

    /// The run may have been cancelled or force-rerun between the runner's
    /// check and the insert of `step`. Then the fresh row is aborted and
    /// nothing is invoked.
    async fn abort_if_moved_on(
        &self,
        run: &WorkflowRun,
        step: &WorkflowStep,
    ) -> StoreResult<Option<StepReport>> {
        let guard = StepGuard {
            step_id: step.id,
            run_id: run.id,
            attempt: run.attempt,
        };
        if self.still_current(&guard).await? {
            return Ok(None);
        }
        tracing::warn!(run_id = run.id, step_id = step.id, "Run moved on before invocation");
        let aborted = self
            .store
            .finish_step(
                step.id,
                StepStatus::Failed,
                StepOutcome::error(ErrorCode::AbortedError, "Run stopped before the action started"),
            )
            .await?;
        Ok(Some(StepReport {
            step: aborted.unwrap_or_else(|| step.clone()),
            superseded: true,
        }))
    }

    /// Run `action` once against `ctx` without touching any run, returning
    /// the step record it would have produced.
    pub async fn preview_step(
        &self,
        action: &SequenceAction,
        ctx: &mut ResolutionContext,
    ) -> StoreResult<WorkflowStep> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let (status, input, outcome) = match self.dispatch(action, ctx).await? {
            Dispatch::Settled {
                status,
                input,
                outcome,
            } => (status, input, outcome),
            Dispatch::Ready(prepared) => {
                let input = redact(&Value::Object(prepared.args.clone()));
                let invocation = self.invoke(&prepared, 0, None).await?;
                (invocation.status, input, invocation.outcome)
            }
        };

        Ok(WorkflowStep {
            id: 0,
            run_id: 0,
            attempt: 0,
            node_id: action.id,
            node_name: action.name.clone(),
            node_type: action.node_type(),
            position: action.position,
            status,
            input_data: input,
            output_data: outcome.output_data,
            raw_response: outcome.raw_response,
            processed_output: outcome.processed_output,
            error_message: outcome.error_message,
            error_code: outcome.error_code,
            retry_count: 0,
            debug_info: outcome.debug_info.unwrap_or_else(|| json!({})),
            started_at,
            completed_at: Some(Utc::now()),
            duration_ms: Some(clock.elapsed().as_millis() as i64),
        })
    }

    async fn dispatch(
        &self,
        action: &SequenceAction,
        ctx: &mut ResolutionContext,
    ) -> StoreResult<Dispatch> {
        let raw_input = redact(&action.configuration);
        let settle = |status: StepStatus, code: ErrorCode, message: String, stage: &str| {
            let mut outcome = StepOutcome::error(code, message);
            outcome.debug_info = Some(json!({"stage": stage}));
            Dispatch::Settled {
                status,
                input: raw_input.clone(),
                outcome,
            }
        };

        let Some(definition) = self.registry.action(&action.app_key, &action.action_key) else {
            return Ok(settle(
                StepStatus::Failed,
                ErrorCode::ValidationError,
                format!("Unknown action '{}'", action.node_type()),
                "validation",
            ));
        };

        let props = definition.props();
        let config = match validate_configuration(&props, &action.configuration) {
            Ok(config) => config,
            Err(e) => {
                return Ok(settle(
                    StepStatus::Failed,
                    ErrorCode::ValidationError,
                    e.to_string(),
                    "validation",
                ))
            }
        };

        let resolved = match ctx.resolve_configuration(&props, &config, action.position) {
            Ok(resolved) => resolved,
            Err(e) => {
                return Ok(settle(
                    StepStatus::Failed,
                    ErrorCode::ResolutionError,
                    e.to_string(),
                    "resolution",
                ))
            }
        };

        let mut args = Map::new();
        for field in &props {
            let Some(value) = resolved.get(&field.key) else {
                continue;
            };
            let coerced = match field.coerce(value.clone()) {
                Ok(coerced) => coerced,
                Err(e) => {
                    return Ok(settle(
                        StepStatus::Failed,
                        ErrorCode::ValidationError,
                        e.to_string(),
                        "coercion",
                    ))
                }
            };
            if field.required && is_empty(&coerced) {
                return Ok(settle(
                    StepStatus::Failed,
                    ErrorCode::ValidationError,
                    format!("Field '{}' resolved to an empty value", field.key),
                    "coercion",
                ));
            }
            args.insert(field.key.clone(), coerced);
        }

        let mut client = None;
        if let Some(integration_id) = action.integration_id {
            let integration = self.store.get_integration(integration_id).await?;
            match integration {
                Some(integration) if integration.is_active() => {
                    match self.clients.client(&integration).await {
                        Ok(c) => client = Some(c),
                        Err(e) if definition.requires_auth() => {
                            return Ok(settle(
                                StepStatus::Waiting,
                                ErrorCode::AuthError,
                                format!("{e}. Reconnect the integration and rerun the workflow"),
                                "auth",
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(integration_id, error = %e, "Integration client unavailable");
                        }
                    }
                }
                Some(integration) if definition.requires_auth() => {
                    return Ok(settle(
                        StepStatus::Waiting,
                        ErrorCode::AuthError,
                        format!(
                            "Integration {} is {}. Reconnect it and rerun the workflow",
                            integration.id,
                            integration.state.as_str()
                        ),
                        "auth",
                    ));
                }
                None if definition.requires_auth() => {
                    return Ok(settle(
                        StepStatus::Waiting,
                        ErrorCode::AuthError,
                        format!(
                            "Integration {integration_id} no longer exists. Connect '{}' and rerun the workflow",
                            action.app_key
                        ),
                        "auth",
                    ));
                }
                _ => {}
            }
        } else if definition.requires_auth() {
            return Ok(settle(
                StepStatus::Waiting,
                ErrorCode::AuthError,
                format!(
                    "No integration connected for '{}'. Connect one and rerun the workflow",
                    action.app_key
                ),
                "auth",
            ));
        }

        Ok(Dispatch::Ready(Prepared {
            action: definition,
            args,
            client,
            integration_id: action.integration_id,
        }))
    }

    async fn call_once(&self, prepared: &Prepared) -> Result<ActionOutput, ActionError> {
        let timeout = self.timeout;
        let client = prepared.client.as_deref();
        self.throttle
            .run(prepared.integration_id, async {
                match tokio::time::timeout(timeout, prepared.action.execute(&prepared.args, client)).await {
                    Ok(result) => result,
                    Err(_) => Err(ActionError::Timeout(timeout.as_millis() as u64)),
                }
            })
            .await
    }

    /// Whether the run is still executing the attempt the step belongs to.
    async fn still_current(&self, guard: &StepGuard) -> StoreResult<bool> {
        Ok(self
            .store
            .get_run(guard.run_id)
            .await?
            .is_some_and(|run| run.status == RunStatus::Running && run.attempt == guard.attempt))
    }

    async fn invoke(
        &self,
        prepared: &Prepared,
        max_retries: u32,
        guard: Option<&StepGuard>,
    ) -> StoreResult<Invocation> {
        let mut retries: u32 = 0;
        loop {
            let started = Instant::now();
            let result = self.call_once(prepared).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let error = match result {
                Ok(output) => return Ok(completed(output, retries, elapsed_ms)),
                Err(error) => error,
            };

            let code = error.code();
            if code.is_retryable() && retries < max_retries {
                retries += 1;
                let message = error.to_string();
                if let Some(guard) = guard {
                    let still_running = self.store.record_retry(guard.step_id, &message).await?
                        && self.still_current(guard).await?;
                    if !still_running {
                        let mut outcome = StepOutcome::error(
                            ErrorCode::AbortedError,
                            format!("Run stopped while retrying: {message}"),
                        );
                        outcome.debug_info = Some(json!({"retries": retries}));
                        return Ok(Invocation {
                            status: StepStatus::Failed,
                            outcome,
                            output: None,
                        });
                    }
                }
                let delay = self.retry.delay_for_retry(retries);
                tracing::info!(
                    retry = retries,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Retrying action"
                );
                tokio::time::sleep(delay).await;
                if let Some(guard) = guard {
                    if !self.still_current(guard).await? {
                        let mut outcome = StepOutcome::error(
                            ErrorCode::AbortedError,
                            format!("Run stopped while waiting to retry: {message}"),
                        );
                        outcome.debug_info = Some(json!({"retries": retries}));
                        return Ok(Invocation {
                            status: StepStatus::Failed,
                            outcome,
                            output: None,
                        });
                    }
                }
                continue;
            }

            let (status, message) = match code {
                ErrorCode::AuthError => (
                    StepStatus::Waiting,
                    format!("{error}. Reconnect the integration and rerun the workflow"),
                ),
                _ if code.is_retryable() && retries > 0 => (
                    StepStatus::Failed,
                    format!("{error} (gave up after {retries} retries)"),
                ),
                _ => (StepStatus::Failed, error.to_string()),
            };
            let mut outcome = StepOutcome::error(code, message);
            outcome.debug_info = Some(json!({"retries": retries, "elapsed_ms": elapsed_ms}));
            return Ok(Invocation {
                status,
                outcome,
                output: None,
            });
        }
    }
}

fn completed(output: ActionOutput, retries: u32, elapsed_ms: u64) -> Invocation {
    let schema = inference::infer(&output.output);
    let processed: Map<String, Value> = inference::flatten(&output.output).into_iter().collect();
    let outcome = StepOutcome {
        output_data: Some(output.output.clone()),
        raw_response: Some(redact(&output.raw_response)),
        processed_output: Some(redact(&Value::Object(processed))),
        error_message: None,
        error_code: None,
        debug_info: Some(json!({
            "schema": schema,
            "retries": retries,
            "elapsed_ms": elapsed_ms,
        })),
    };
    Invocation {
        status: StepStatus::Completed,
        outcome,
        output: Some(output.output),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{IntegrationState, NewAction, NewIntegration, NewRun, NewSequence};
    use crate::store::{IntegrationStore, MemoryStore, RunLedger, SequenceStore};
    use async_trait::async_trait;
    use funnelflow_actions::{AppInfo, FieldSchema};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEST_APP: AppInfo = AppInfo {
        key: "test",
        name: "Test",
        requires_auth: false,
    };

    /// Counts calls; fails with a retryable error when `flaky` is set.
    struct Counted {
        calls: Arc<AtomicUsize>,
        flaky: bool,
    }

    #[async_trait]
    impl Action for Counted {
        fn key(&self) -> &'static str {
            if self.flaky {
                "flaky"
            } else {
                "echo"
            }
        }
        fn label(&self) -> &'static str {
            "Counted"
        }
        fn requires_auth(&self) -> bool {
            false
        }
        fn props(&self) -> Vec<FieldSchema> {
            vec![FieldSchema::text("text", "Text")]
        }
        fn sample(&self) -> Value {
            json!({"text": "sample"})
        }
        async fn execute(
            &self,
            args: &Map<String, Value>,
            _client: Option<&dyn IntegrationClient>,
        ) -> Result<ActionOutput, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.flaky {
                return Err(ActionError::ExternalApi {
                    status: Some(503),
                    message: "unavailable".into(),
                });
            }
            Ok(ActionOutput::same(json!({"text": args.get("text").cloned()})))
        }
    }

    /// Cancels `run_id` while the client is being looked up, the way an
    /// operator cancel lands between the runner's check and invocation.
    struct CancelOnConnect {
        store: Arc<MemoryStore>,
        run_id: i64,
    }

    #[async_trait]
    impl ClientProvider for CancelOnConnect {
        async fn client(
            &self,
            _integration: &crate::db::models::Integration,
        ) -> Result<Arc<dyn IntegrationClient>, ActionError> {
            self.store
                .transition_run(self.run_id, &[RunStatus::Running], RunStatus::Failed)
                .await
                .unwrap();
            Err(ActionError::Auth("no client".into()))
        }
    }

    struct NoClients;

    #[async_trait]
    impl ClientProvider for NoClients {
        async fn client(
            &self,
            _integration: &crate::db::models::Integration,
        ) -> Result<Arc<dyn IntegrationClient>, ActionError> {
            Err(ActionError::Auth("no clients in tests".into()))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<Registry>,
        calls: Arc<AtomicUsize>,
        run: WorkflowRun,
        action: SequenceAction,
    }

    async fn fixture(action_key: &str, max_retries: i32, integrated: bool) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry.register_action(
            TEST_APP,
            Counted {
                calls: calls.clone(),
                flaky: false,
            },
        );
        registry.register_action(
            TEST_APP,
            Counted {
                calls: calls.clone(),
                flaky: true,
            },
        );

        let store = Arc::new(MemoryStore::new());
        let integration_id = if integrated {
            let integration = store
                .create_integration(NewIntegration {
                    tenant_id: "t".into(),
                    app_key: "test".into(),
                    name: "Test".into(),
                    credentials: Vec::new(),
                    config: json!({}),
                })
                .await
                .unwrap();
            store
                .set_integration_state(integration.id, IntegrationState::Active, None, true)
                .await
                .unwrap();
            Some(integration.id)
        } else {
            None
        };
        let sequence = store
            .create_sequence(NewSequence {
                tenant_id: "t".into(),
                name: "Welcome".into(),
                enabled: true,
            })
            .await
            .unwrap();
        let action = store
            .insert_action(NewAction {
                sequence_id: sequence.id,
                position: None,
                name: action_key.to_string(),
                app_key: "test".into(),
                integration_id,
                action_key: action_key.to_string(),
                configuration: json!({"text": "hi"}),
                max_retries,
                enabled: true,
            })
            .await
            .unwrap();
        let run = store
            .create_run(NewRun {
                sequence_id: sequence.id,
                trigger_id: 0,
                event_id: 0,
                arguments: json!({}),
            })
            .await
            .unwrap();
        let run = store
            .transition_run(run.id, &[RunStatus::Pending], RunStatus::Running)
            .await
            .unwrap()
            .unwrap();

        Fixture {
            store,
            registry: Arc::new(registry),
            calls,
            run,
            action,
        }
    }

    fn executor(
        fixture: &Fixture,
        clients: Arc<dyn ClientProvider>,
        retry: RetryPolicy,
    ) -> ActionExecutor {
        ActionExecutor::new(
            fixture.store.clone(),
            fixture.registry.clone(),
            clients,
            IntegrationThrottle::new(1, Duration::ZERO),
            retry,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_step_completes_and_records_output() {
        let fixture = fixture("echo", 0, false).await;
        let executor = executor(&fixture, Arc::new(NoClients), RetryPolicy::immediate());
        let mut ctx = ResolutionContext::new(json!({}));

        let report = executor
            .execute_step(&fixture.run, &fixture.action, &mut ctx)
            .await
            .unwrap();
        assert!(!report.superseded);
        assert_eq!(report.step.status, StepStatus::Completed);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);

        let run = fixture.store.get_run(fixture.run.id).await.unwrap().unwrap();
        assert_eq!(run.output["1"], json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_cancel_during_dispatch_skips_invocation() {
        let fixture = fixture("echo", 0, true).await;
        let clients = Arc::new(CancelOnConnect {
            store: fixture.store.clone(),
            run_id: fixture.run.id,
        });
        let executor = executor(&fixture, clients, RetryPolicy::immediate());
        let mut ctx = ResolutionContext::new(json!({}));

        let report = executor
            .execute_step(&fixture.run, &fixture.action, &mut ctx)
            .await
            .unwrap();
        assert!(report.superseded);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);

        let steps = fixture.store.list_steps(fixture.run.id, None).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error_code, Some(ErrorCode::AbortedError));
        let run = fixture.store.get_run(fixture.run.id).await.unwrap().unwrap();
        assert!(run.output.get("1").is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_retries() {
        let fixture = fixture("flaky", 3, false).await;
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(300),
        };
        let executor = executor(&fixture, Arc::new(NoClients), retry);

        let store = fixture.store.clone();
        let run_id = fixture.run.id;
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store
                .transition_run(run_id, &[RunStatus::Running], RunStatus::Failed)
                .await
                .unwrap();
        });

        let mut ctx = ResolutionContext::new(json!({}));
        let report = executor
            .execute_step(&fixture.run, &fixture.action, &mut ctx)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.step.status, StepStatus::Failed);
        assert_eq!(report.step.error_code, Some(ErrorCode::AbortedError));
        assert_eq!(report.step.retry_count, 1);
        assert!(report
            .step
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Run stopped while waiting to retry"));
    }
}
