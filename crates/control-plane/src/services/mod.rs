//! Service layer for the Funnelflow control plane.
//!
//! Services hold the business rules and coordinate between handlers, the
//! engine and the store.

pub mod discovery;
pub mod event;
pub mod integration;
pub mod sequence;
pub mod workflow;

pub use discovery::{DiscoveryQuery, DiscoveryService};
pub use event::EventService;
pub use integration::IntegrationService;
pub use sequence::SequenceService;
pub use workflow::WorkflowService;
