//! Peer mesh
//!
//! This module re-exports the chat-mesh crate and adds the pieces that are
//! specific to running it as a process: the change-event log sink and
//! fixture seeding.

// Re-export everything from chat-mesh crate
pub use chat_mesh::*;

pub mod change_log;
pub mod fixtures;

pub use change_log::ChangeLogger;
pub use fixtures::Fixtures;
