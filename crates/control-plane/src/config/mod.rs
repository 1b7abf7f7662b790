//! Configuration module for the Funnelflow control plane.
//!
//! Configuration is loaded from environment variables with `envy`; a `.env`
//! file is honoured through `dotenvy` in `main`.

mod app;
mod database;

pub use app::{AppConfig, StoreBackend};
pub use database::DatabaseConfig;
