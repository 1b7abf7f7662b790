//! Application configuration for the Funnelflow control plane.

use serde::Deserialize;
use std::time::Duration;

/// Which store implementation backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `FUNNEL_`:
/// - `FUNNEL_HOST`: Server bind address (default: "0.0.0.0")
/// - `FUNNEL_PORT`: Server port (default: 8090)
/// - `FUNNEL_STORE`: `memory` or `postgres` (default: memory)
/// - `FUNNEL_ENCRYPTION_KEY`: base64 AES-256 key for integration credentials
/// - `FUNNEL_NATS_URL`: NATS URL for run notifications (optional)
/// - `FUNNEL_LOG_JSON`: Emit JSON logs (default: false)
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default)]
    pub store: StoreBackend,

    /// Base64-encoded 32 byte key. A random key is generated when unset,
    /// which makes stored credentials unreadable after a restart.
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    #[serde(default)]
    pub log_json: bool,

    /// Runs executed concurrently
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Bound on a single action invocation, in milliseconds
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    /// Default for actions saved without `max_retries`
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Concurrent calls allowed per integration
    #[serde(default = "default_integration_concurrency")]
    pub integration_concurrency: usize,

    /// Pause applied to an integration after an HTTP 429, in milliseconds
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,

    /// Running runs not updated for this long are flagged stale
    #[serde(default = "default_stale_run_seconds")]
    pub stale_run_seconds: u64,

    /// Stale sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_server_name() -> String {
    "funnelflow-control-plane".to_string()
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_action_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_integration_concurrency() -> usize {
    4
}

fn default_rate_limit_cooldown_ms() -> u64 {
    5_000
}

fn default_stale_run_seconds() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `FUNNEL_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FUNNEL_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            store: StoreBackend::default(),
            encryption_key: None,
            nats_url: None,
            log_json: false,
            worker_concurrency: default_worker_concurrency(),
            action_timeout_ms: default_action_timeout_ms(),
            default_max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            integration_concurrency: default_integration_concurrency(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
            stale_run_seconds: default_stale_run_seconds(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}
