// Terminal front end and chat session for the Live2D companion.

pub mod cli;
pub mod commands;
pub mod session;

pub use session::{ChatSession, SessionError};
