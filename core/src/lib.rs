/// EstateChat - message synchronization for property conversations
///
/// Keeps one duplicate-free, newest-first feed per open chat by reconciling optimistic
/// sends, periodic polling of the backend, and the owner's view over several inquirers.

pub mod error;
pub mod config;
pub mod types;
pub mod session;
pub mod api;
pub mod message_store;
pub mod state;
pub mod resolver;
pub mod poller;
pub mod send;
pub mod owner;
pub mod engine;
pub mod stub_server;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::ChatEngine;
pub use error::{ChatError, Result};
pub use session::{Session, SessionHandle};
