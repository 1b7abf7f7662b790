//! Database module for the Funnelflow control plane.
//!
//! Connection pool, domain models and the SQL used by
//! [`PgStore`](crate::store::PgStore).

pub mod models;
pub mod pool;
pub mod queries;

pub use pool::{create_pool, run_migrations, DbPool};
