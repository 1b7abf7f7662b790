//! Workflow execution engine.
//!
//! - **Sequencer**: matches events to triggers and creates runs
//! - **Queue**: run queue and the bounded worker loop
//! - **Runner**: executes a run's actions in order
//! - **Executor**: executes one action as one step (dispatch, throttle,
//!   timeout, retry)
//! - **Recovery**: rerun, force-rerun and cancel
//! - **Resources**: configuration-time resource search
//! - **Sweeper**: flags runs that stopped making progress

pub mod clients;
pub mod conditions;
pub mod executor;
pub mod queue;
pub mod recovery;
pub mod resources;
pub mod retry;
pub mod runner;
pub mod sequencer;
pub mod sweeper;
pub mod throttle;

pub use clients::{ClientProvider, HttpClientProvider};
pub use conditions::Conditions;
pub use executor::{ActionExecutor, StepReport};
pub use queue::{ActiveSet, RunQueue, RunWorker};
pub use recovery::RecoveryController;
pub use resources::{ResourceResolver, ResourceSearchRequest, ResourceSearchResponse};
pub use retry::RetryPolicy;
pub use runner::{latest_steps, RunExit, WorkflowRunner};
pub use sequencer::SequenceResolver;
pub use sweeper::StaleSweeper;
pub use throttle::IntegrationThrottle;

use funnelflow_actions::Registry;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::nats::RunPublisher;
use crate::store::Store;

/// Engine handles shared by the services.
#[derive(Clone)]
pub struct Engine {
    pub queue: RunQueue,
    pub executor: ActionExecutor,
    pub sequencer: SequenceResolver,
    pub recovery: RecoveryController,
    pub resources: ResourceResolver,
    pub throttle: IntegrationThrottle,
    /// Runs executing in this process
    pub active: ActiveSet,
}

impl Engine {
    /// Build the engine. The returned worker must be spawned for queued
    /// runs to execute.
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        clients: Arc<dyn ClientProvider>,
        config: &AppConfig,
        publisher: Option<RunPublisher>,
    ) -> (Self, RunWorker) {
        let throttle =
            IntegrationThrottle::new(config.integration_concurrency, config.rate_limit_cooldown());
        let executor = ActionExecutor::new(
            store.clone(),
            registry.clone(),
            clients.clone(),
            throttle.clone(),
            RetryPolicy::from_config(config),
            config.action_timeout(),
        );
        let (queue, rx) = RunQueue::channel();
        let runner = WorkflowRunner::new(store.clone(), executor.clone(), publisher.clone());
        let worker = RunWorker::new(runner, queue.clone(), rx, config.worker_concurrency);

        let engine = Self {
            sequencer: SequenceResolver::new(store.clone(), registry.clone(), queue.clone()),
            recovery: RecoveryController::new(store.clone(), queue.clone(), publisher),
            resources: ResourceResolver::new(
                store,
                registry,
                clients,
                throttle.clone(),
                config.action_timeout(),
            ),
            active: worker.active(),
            queue,
            executor,
            throttle,
        };
        (engine, worker)
    }

    /// Staleness sweeper configured from `config`.
    pub fn sweeper(store: Arc<dyn Store>, config: &AppConfig) -> StaleSweeper {
        StaleSweeper::new(
            store,
            Duration::from_secs(config.stale_run_seconds),
            Duration::from_secs(config.sweep_interval_seconds.max(1)),
        )
    }
}
