pub mod action;
pub mod event;
pub mod message;

pub use action::*;
pub use event::*;
pub use message::*;
