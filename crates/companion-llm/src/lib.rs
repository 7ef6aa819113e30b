// Client for the hosted chat model: prompt assembly, HTTP transport, and
// reply clean-up.

pub mod client;
pub mod prompt;
pub mod reply;

pub use client::{ChatClient, LlmClient, LlmError, LlmEvent};
pub use prompt::{build_request, ChatMessage, CompletionRequest};
pub use reply::clean_reply;
