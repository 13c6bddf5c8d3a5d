//! ircserv core
//!
//! This crate provides the core of a line-oriented IRC-subset chat server:
//! the connection event loop, line framing, the registration state machine,
//! and the channel/membership model with moderation modes.

pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod server;

pub use buffer::{LineBuffer, MAX_INBUF, MAX_LINE_LEN};
pub use channel::{Channel, ModeStep};
pub use client::{Client, ClientId};
pub use config::Config;
pub use connection::ServerEvent;
pub use error::{Error, Result};
pub use message::Command;
pub use server::{Server, ServerState};

/// Re-exports for convenience
pub use tracing::{debug, error, info, warn};
