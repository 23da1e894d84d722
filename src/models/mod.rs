//! Data models for messages, socket events, presence and rooms.

pub mod event;
pub mod message;
pub mod presence;
pub mod room;

pub use event::*;
pub use message::*;
pub use presence::*;
pub use room::*;
