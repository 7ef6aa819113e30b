// Command relay between the chat backend and Live2D front ends.

pub mod error;
pub mod hub;
pub mod listener;
pub mod server;
pub mod trigger;

pub use hub::BroadcastHub;
pub use listener::WsEvent;
pub use server::{RelayState, shutdown_signal};
pub use trigger::{TriggerClient, TriggerError};
