//! Funnelflow Control Plane Library
//!
//! Automation core of the checkout funnel: external events fire triggers,
//! which start workflow runs executing a sequence's actions in order.
//!
//! - **Integration Store**: connections to third-party apps with encrypted
//!   credentials
//! - **Schema Inferencer**: `dot.path -> type` maps from exemplar payloads
//! - **Template Resolver**: `{{trigger.path}}` and `{{N.path}}` expressions
//! - **Engine**: sequence resolution, step execution, recovery
//! - **Run Ledger**: persisted runs, steps and logs
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`store`]: Persistence boundary with Postgres and in-memory stores
//! - [`engine`]: Run queue, runner, executor, recovery and sweeper
//! - [`services`]: Business rules behind the HTTP API
//! - [`handlers`]: HTTP route handlers and the router
//! - [`state`]: Shared application state
//!
//! ## Example
//!
//! ```ignore
//! use funnelflow_actions::apps::default_registry;
//! use funnelflow_control_plane::{
//!     config::AppConfig, crypto::CredentialCipher, handlers, state::AppState,
//!     store::MemoryStore,
//! };
//!
//! let config = AppConfig::default();
//! let cipher = CredentialCipher::from_config(None)?;
//! let (state, worker) = AppState::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(default_registry()),
//!     cipher,
//!     config,
//!     None,
//! );
//! worker.spawn(shutdown_rx);
//! let app = handlers::router(&state);
//! ```

pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod inference;
pub mod nats;
pub mod result_ext;
pub mod sanitize;
pub mod services;
pub mod state;
pub mod store;
pub mod template;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
