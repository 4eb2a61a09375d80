#[macro_use]
extern crate tracing;
mod engine;
mod error;
mod hub;
mod metadata;
mod options;
pub mod tools;
pub use engine::DriverEngine;
pub use error::EngineError;
pub use hub::{GatewayState, router};
pub use metadata::DriverMetadata;
pub use options::{EngineOptions, EngineOptionsBuilder};
