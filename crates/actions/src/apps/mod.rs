//! Built-in apps.

pub mod checkout;
pub mod rest;
pub mod utility;
pub mod webhook;

use crate::registry::Registry;

/// Registry with every built-in app registered.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    checkout::register(&mut registry);
    webhook::register(&mut registry);
    rest::register(&mut registry);
    utility::register(&mut registry);
    registry
}
