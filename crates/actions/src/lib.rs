//! Funnelflow action library.
//!
//! Provides the app registry (actions, triggers and resource sources), the
//! declared configuration schema with its typed values, and the
//! [`IntegrationClient`](client::IntegrationClient) boundary used to reach
//! third-party APIs.

pub mod apps;
pub mod client;
pub mod error;
pub mod registry;
pub mod schema;

pub use client::{
    ApiRequest, ApiResponse, AuthCredentials, ConnectionSettings, ConnectionTest, HttpIntegrationClient,
    HttpMethod, IntegrationClient,
};
pub use error::{ActionError, ErrorCode};
pub use registry::{
    Action, ActionDescriptor, ActionOutput, AppDescriptor, AppInfo, Registry, ResourceOption,
    ResourceSource, Trigger, TriggerDescriptor,
};
pub use schema::{validate_configuration, ConfigValue, Configuration, FieldOption, FieldSchema, FieldType};
