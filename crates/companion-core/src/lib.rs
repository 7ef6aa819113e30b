// Shared building blocks: configuration, chat log storage, personality
// analysis, and the relay wire protocol.

pub mod config;
pub mod personality;
pub mod protocol;
pub mod store;
