use std::io;
use thiserror::Error;

/// Unified error type for the forwarder
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum ForwardError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listener could not be set up
    #[error("Bind error: {0}")]
    Bind(String),

    /// Outbound connection to the target failed
    #[error("Connect error: {0}")]
    Connect(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ForwardError>;

impl From<anyhow::Error> for ForwardError {
    fn from(err: anyhow::Error) -> Self {
        ForwardError::Other(err.to_string())
    }
}
