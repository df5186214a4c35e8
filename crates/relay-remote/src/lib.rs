pub mod agent;
pub mod decoder;
pub mod extractor;
pub mod merge;
pub mod partial_json;
pub mod platform;
pub mod run;
pub mod translate;

#[cfg(test)]
mod fake_platform;

pub use agent::*;
pub use decoder::*;
pub use extractor::*;
pub use merge::*;
pub use partial_json::*;
pub use platform::*;
pub use run::*;
pub use translate::*;
