//! Domain models shared by the store implementations.

pub mod event;
pub mod integration;
pub mod sequence;
pub mod workflow;

pub use event::*;
pub use integration::*;
pub use sequence::*;
pub use workflow::*;
