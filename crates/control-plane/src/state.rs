//! Application state for the Funnelflow control plane server.
//!
//! Holds the store, the engine and the services built on them. Each domain
//! router takes its service as state; health checks take the whole
//! [`AppState`].

use funnelflow_actions::Registry;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::crypto::CredentialCipher;
use crate::engine::{ClientProvider, Engine, HttpClientProvider, RunWorker};
use crate::nats::RunPublisher;
use crate::services::{
    DiscoveryService, EventService, IntegrationService, SequenceService, WorkflowService,
};
use crate::store::Store;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,

    pub registry: Arc<Registry>,

    /// Application configuration
    pub config: Arc<AppConfig>,

    pub engine: Engine,

    /// Run notifications (optional)
    pub publisher: Option<RunPublisher>,

    pub integrations: IntegrationService,
    pub sequences: SequenceService,
    pub workflows: WorkflowService,
    pub events: EventService,
    pub discovery: DiscoveryService,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the state with HTTP integration clients. The returned worker
    /// must be spawned for runs to execute.
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        cipher: CredentialCipher,
        config: AppConfig,
        publisher: Option<RunPublisher>,
    ) -> (Self, RunWorker) {
        let clients: Arc<dyn ClientProvider> = Arc::new(HttpClientProvider::new(cipher.clone()));
        Self::with_clients(store, registry, cipher, clients, config, publisher)
    }

    /// Like [`AppState::new`] with a caller-supplied client provider.
    pub fn with_clients(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        cipher: CredentialCipher,
        clients: Arc<dyn ClientProvider>,
        config: AppConfig,
        publisher: Option<RunPublisher>,
    ) -> (Self, RunWorker) {
        let (engine, worker) = Engine::new(
            store.clone(),
            registry.clone(),
            clients.clone(),
            &config,
            publisher.clone(),
        );

        let integrations =
            IntegrationService::new(store.clone(), registry.clone(), cipher, clients.clone());
        let sequences = SequenceService::new(
            store.clone(),
            registry.clone(),
            clients,
            engine.executor.clone(),
            engine.throttle.clone(),
            &config,
        );
        let workflows = WorkflowService::new(store.clone(), engine.recovery.clone());
        let events = EventService::new(registry.clone(), engine.sequencer.clone());
        let discovery = DiscoveryService::new(registry.clone(), engine.resources.clone());

        let state = Self {
            store,
            registry,
            config: Arc::new(config),
            engine,
            publisher,
            integrations,
            sequences,
            workflows,
            events,
            discovery,
            start_time: std::time::Instant::now(),
        };
        (state, worker)
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Check if NATS is configured and connected.
    pub fn has_nats(&self) -> bool {
        self.publisher.is_some()
    }
}
