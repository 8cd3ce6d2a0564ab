//! Error types for the pool engine
//!
//! A single `thiserror`-based error enum covers everything that can go wrong
//! outside the per-share protocol error codes, which are modeled separately
//! in [`crate::stratum::protocol`].

use thiserror::Error;

/// Main error type for the pool engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hex decoding errors
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Daemon RPC errors
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Stratum protocol errors
    #[error("Stratum error: {0}")]
    Stratum(String),

    /// Invalid block template data
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// Invalid address or script input
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Pool startup failures that abort the process
    #[error("Startup error: {0}")]
    Startup(String),

    /// Channel send errors
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for the pool engine
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a daemon RPC error
    pub fn daemon(msg: impl Into<String>) -> Self {
        Self::Daemon(msg.into())
    }

    /// Create a stratum error
    pub fn stratum(msg: impl Into<String>) -> Self {
        Self::Stratum(msg.into())
    }

    /// Create an invalid template error
    pub fn invalid_template(msg: impl Into<String>) -> Self {
        Self::InvalidTemplate(msg.into())
    }

    /// Create an invalid address error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create a startup-fatal error
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Create a channel send error
    pub fn channel_send(msg: impl Into<String>) -> Self {
        Self::ChannelSend(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("missing ports");
        assert_eq!(err.to_string(), "Configuration error: missing ports");

        let err = Error::daemon("instance 0 offline");
        assert_eq!(err.to_string(), "Daemon error: instance 0 offline");
    }

    #[test]
    fn test_error_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));

        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
