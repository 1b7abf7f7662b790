//! NATS JetStream integration.
//!
//! Publishes run status changes for external consumers.

pub mod publisher;

pub use publisher::{NatsError, RunNotification, RunPublisher};
