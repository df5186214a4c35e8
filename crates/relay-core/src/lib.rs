pub mod actions;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod guardrails;
pub mod orchestrator;

pub use actions::*;
pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use guardrails::*;
pub use orchestrator::*;
