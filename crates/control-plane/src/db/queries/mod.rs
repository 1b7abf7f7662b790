//! SQL for the Postgres store, organized by table.
//!
//! Each module reads rows into private `FromRow` structs and converts them
//! into the domain models, rejecting unknown status strings.

pub mod event;
pub mod integration;
pub mod sequence;
pub mod workflow;
