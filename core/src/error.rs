//! Error types for the chat server

use thiserror::Error;

/// Main error type for the chat server
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
