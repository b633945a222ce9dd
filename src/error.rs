//! Error types for linevault

use std::io;
use thiserror::Error;

/// Result type alias for linevault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the server, its store, and the client library
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Server already closed")]
    Closed,

    #[error("Server already started")]
    AlreadyStarted,

    #[error("Line exceeds maximum length of {0} bytes")]
    LineTooLong(usize),

    #[error("Client error: {0}")]
    Client(String),
}
