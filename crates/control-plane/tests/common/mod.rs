//! Shared harness for the end-to-end scenarios: an in-memory control plane
//! with a running worker, recorder actions that record their invocations and a
//! stub integration client.

#![allow(dead_code)]

use async_trait::async_trait;
use funnelflow_actions::apps::default_registry;
use funnelflow_actions::{
    Action, ActionError, ActionOutput, ApiRequest, ApiResponse, AppInfo, ConnectionTest,
    FieldSchema, FieldType, IntegrationClient, Registry, ResourceOption, ResourceSource,
};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use funnelflow_control_plane::config::AppConfig;
use funnelflow_control_plane::crypto::CredentialCipher;
use funnelflow_control_plane::db::models::{
    ActionCreateRequest, Integration, IntegrationCreateRequest, RunStatus, Sequence,
    SequenceCreateRequest, StepStatus, TriggerCreateRequest, WorkflowRun, WorkflowStep,
};
use funnelflow_control_plane::engine::ClientProvider;
use funnelflow_control_plane::state::AppState;
use funnelflow_control_plane::store::{MemoryStore, RunLedger};

pub const LAB: AppInfo = AppInfo {
    key: "lab",
    name: "Lab",
    requires_auth: false,
};

pub const CRM: AppInfo = AppInfo {
    key: "crm",
    name: "CRM",
    requires_auth: true,
};

/// One recorded invocation. `finished` stays unset when the call was
/// dropped by a timeout.
#[derive(Debug, Clone)]
pub struct Call {
    pub action: &'static str,
    pub args: Map<String, Value>,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Records invocations and scripts their delays.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    delays: Arc<Mutex<VecDeque<Duration>>>,
    pub resource_calls: Arc<AtomicUsize>,
}

impl Recorder {
    /// Delays applied to the next `lab.record` calls, in order.
    pub fn script(&self, delays: &[u64]) {
        let mut queue = self.delays.lock().unwrap();
        queue.extend(delays.iter().map(|ms| Duration::from_millis(*ms)));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn start(&self, action: &'static str, args: &Map<String, Value>) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(Call {
            action,
            args: args.clone(),
            started: Instant::now(),
            finished: None,
        });
        calls.len() - 1
    }

    fn finish(&self, index: usize) {
        self.calls.lock().unwrap()[index].finished = Some(Instant::now());
    }

    fn next_delay(&self) -> Duration {
        self.delays.lock().unwrap().pop_front().unwrap_or_default()
    }
}

/// `lab.record`: echoes its arguments after the scripted delay.
struct Record(Recorder);

#[async_trait]
impl Action for Record {
    fn key(&self) -> &'static str {
        "record"
    }

    fn label(&self) -> &'static str {
        "Record"
    }

    fn requires_auth(&self) -> bool {
        false
    }

    fn props(&self) -> Vec<FieldSchema> {
        vec![
            FieldSchema::text("label", "Label").required(),
            FieldSchema::new("payload", "Payload", FieldType::Json),
        ]
    }

    fn sample(&self) -> Value {
        json!({"label": "welcome Jane", "payload": {"email": "jane@example.com"}})
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        _client: Option<&dyn IntegrationClient>,
    ) -> Result<ActionOutput, ActionError> {
        let index = self.0.start("lab.record", args);
        tokio::time::sleep(self.0.next_delay()).await;
        self.0.finish(index);
        Ok(ActionOutput::same(json!({
            "label": args.get("label").cloned().unwrap_or(Value::Null),
            "payload": args.get("payload").cloned().unwrap_or(Value::Null),
        })))
    }
}

/// `crm.tag`: needs an integration client.
struct Tag(Recorder);

#[async_trait]
impl Action for Tag {
    fn key(&self) -> &'static str {
        "tag"
    }

    fn label(&self) -> &'static str {
        "Tag contact"
    }

    fn requires_auth(&self) -> bool {
        true
    }

    fn props(&self) -> Vec<FieldSchema> {
        vec![
            FieldSchema::text("email", "Email").required(),
            FieldSchema::text("tag", "Tag").required().dynamic("segments"),
        ]
    }

    fn sample(&self) -> Value {
        json!({"email": "jane@example.com", "tag": "buyer"})
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        client: Option<&dyn IntegrationClient>,
    ) -> Result<ActionOutput, ActionError> {
        let client = client.ok_or_else(|| ActionError::Auth("CRM client missing".into()))?;
        let index = self.0.start("crm.tag", args);
        let response = client
            .request(ApiRequest::post("/contacts/tags", Value::Object(args.clone())))
            .await?;
        self.0.finish(index);
        Ok(ActionOutput::new(
            json!({"email": args["email"].clone(), "tag": args["tag"].clone()}),
            response.body,
        ))
    }
}

/// `crm.segments` resource.
struct Segments(Recorder);

#[async_trait]
impl ResourceSource for Segments {
    fn key(&self) -> &'static str {
        "segments"
    }

    async fn search(
        &self,
        query: &str,
        _client: Option<&dyn IntegrationClient>,
    ) -> Result<Vec<ResourceOption>, ActionError> {
        self.0.resource_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ResourceOption {
            value: "seg_buyers".into(),
            label: format!("Buyers ({query})"),
        }])
    }
}

struct StubClient {
    id: i64,
}

#[async_trait]
impl IntegrationClient for StubClient {
    fn integration_id(&self) -> i64 {
        self.id
    }

    async fn request(&self, _request: ApiRequest) -> Result<ApiResponse, ActionError> {
        Ok(ApiResponse {
            status: 200,
            body: json!({"ok": true, "token": "crm-secret"}),
        })
    }

    async fn test(&self) -> ConnectionTest {
        ConnectionTest::ok("Connected to CRM")
    }
}

struct StubProvider;

#[async_trait]
impl ClientProvider for StubProvider {
    async fn client(
        &self,
        integration: &Integration,
    ) -> Result<Arc<dyn IntegrationClient>, ActionError> {
        Ok(Arc::new(StubClient { id: integration.id }))
    }
}

fn registry(recorder: &Recorder) -> Registry {
    let mut registry = default_registry();
    registry.register_action(LAB, Record(recorder.clone()));
    registry.register_action(CRM, Tag(recorder.clone()));
    registry.register_resource(CRM, Segments(recorder.clone()));
    registry
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub recorder: Recorder,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig {
            action_timeout_ms: 2_000,
            retry_base_ms: 1,
            retry_max_ms: 5,
            rate_limit_cooldown_ms: 10,
            ..AppConfig::default()
        };
        configure(&mut config);

        let recorder = Recorder::default();
        let store = Arc::new(MemoryStore::new());
        let cipher = CredentialCipher::from_bytes(&CredentialCipher::generate_key()).unwrap();
        let (state, worker) = AppState::with_clients(
            store.clone(),
            Arc::new(registry(&recorder)),
            cipher,
            Arc::new(StubProvider),
            config,
            None,
        );
        let (shutdown, rx) = watch::channel(false);
        let worker = worker.spawn(rx);

        Self {
            state,
            store,
            recorder,
            shutdown,
            worker,
        }
    }

    /// Sequence listening for `checkout.purchase_completed`, with `actions`
    /// added in order.
    pub async fn sequence(&self, actions: Vec<ActionCreateRequest>) -> Sequence {
        self.sequence_with_conditions(None, actions).await
    }

    pub async fn sequence_with_conditions(
        &self,
        conditions: Option<Value>,
        actions: Vec<ActionCreateRequest>,
    ) -> Sequence {
        let sequences = &self.state.sequences;
        let sequence = sequences
            .create(SequenceCreateRequest {
                tenant_id: "acme".into(),
                name: "Post-purchase".into(),
                enabled: true,
            })
            .await
            .unwrap();
        sequences
            .add_trigger(
                sequence.id,
                TriggerCreateRequest {
                    app_key: "checkout".into(),
                    trigger_key: "purchase_completed".into(),
                    integration_id: None,
                    configuration: Some(json!({"funnel_id": "fn_main"})),
                    conditions,
                },
            )
            .await
            .unwrap();
        for action in actions {
            sequences.add_action(sequence.id, action).await.unwrap();
        }
        sequence
    }

    pub async fn crm_integration(&self) -> i64 {
        self.state
            .integrations
            .create(IntegrationCreateRequest {
                tenant_id: "acme".into(),
                app_key: "crm".into(),
                name: "CRM".into(),
                credentials: Some(json!({"type": "bearer", "token": "crm-secret"})),
                config: Some(json!({"base_url": "https://crm.example.com"})),
            })
            .await
            .unwrap()
            .id
    }

    /// Ingest a purchase and return the created run ids.
    pub async fn purchase(&self, payload: Value) -> Vec<i64> {
        self.state
            .events
            .ingest("checkout", "purchase_completed", None, payload)
            .await
            .unwrap()
            .run_ids
    }

    pub async fn run(&self, run_id: i64) -> WorkflowRun {
        self.store.get_run(run_id).await.unwrap().unwrap()
    }

    pub async fn steps(&self, run_id: i64) -> Vec<WorkflowStep> {
        self.store.list_steps(run_id, None).await.unwrap()
    }

    /// Wait until the run reaches `status` at `attempt`.
    pub async fn wait_for(&self, run_id: i64, status: RunStatus, attempt: i32) -> WorkflowRun {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let run = self.run(run_id).await;
            if run.status == status && run.attempt == attempt {
                return run;
            }
            assert!(
                Instant::now() < deadline,
                "run {run_id} stuck in {} (attempt {}), expected {status} (attempt {attempt})",
                run.status,
                run.attempt
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until some step of the run is executing.
    pub async fn wait_for_running_step(&self, run_id: i64) -> WorkflowStep {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(step) = self
                .steps(run_id)
                .await
                .into_iter()
                .find(|s| s.status == StepStatus::Running)
            {
                return step;
            }
            assert!(Instant::now() < deadline, "run {run_id} never started a step");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.worker.await;
    }
}

pub fn lab(label: &str, payload: Option<Value>) -> ActionCreateRequest {
    let mut configuration = json!({ "label": label });
    if let Some(payload) = payload {
        configuration["payload"] = payload;
    }
    ActionCreateRequest {
        app_key: "lab".into(),
        action_key: "record".into(),
        name: None,
        position: None,
        integration_id: None,
        configuration: Some(configuration),
        max_retries: Some(0),
        enabled: true,
    }
}

pub fn purchase_payload() -> Value {
    json!({
        "order_id": "ord_2001",
        "funnel_id": "fn_main",
        "member_email": "ada@example.com",
        "member_name": "Ada Lovelace",
        "amount": 4900,
        "currency": "USD",
        "product": {"id": "prod_7", "name": "Analytical Engine Course"},
        "line_items": [{"sku": "SKU-1", "quantity": 1}]
    })
}
