//! Error types for the router.
//!
//! A structured error enum is used instead of `anyhow::Error` so that the
//! operator console and the resolution engine can distinguish recoverable
//! conditions (bad command input, a port that never produced valid traffic)
//! from fatal ones (no serial ports at start-up).

use std::io;
use thiserror::Error;

/// Main error type for router operations.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Configuration errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network I/O errors (bind failures, socket errors)
    #[error("Network error on endpoint '{endpoint}': {source}")]
    Network {
        /// Name or address of the endpoint that failed
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Serial port errors (device not found, permission denied)
    #[error("Serial port error on '{device}': {source}")]
    Serial {
        /// Path to the serial device
        device: String,
        /// Underlying serial error
        #[source]
        source: tokio_serial::Error,
    },

    /// Port resolution errors (empty pool, unresolvable endpoint)
    #[error("Resolution error: {0}")]
    Resolve(String),

    /// Malformed operator console input (reported back on the connection)
    #[error("{0}")]
    BadInput(String),

    /// Endpoint script errors (parse failures, unknown targets)
    #[error("Script error: {0}")]
    Script(String),

    /// Other unexpected errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use RouterError
pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error
    pub fn network(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Create a new serial error
    pub fn serial(device: impl Into<String>, source: tokio_serial::Error) -> Self {
        Self::Serial {
            device: device.into(),
            source,
        }
    }

    /// Create a new resolution error
    pub fn resolve(msg: impl Into<String>) -> Self {
        Self::Resolve(msg.into())
    }

    /// Create a new bad-input error
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    /// Create a new script error
    pub fn script(msg: impl Into<String>) -> Self {
        Self::Script(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<io::Error> for RouterError {
    fn from(err: io::Error) -> Self {
        Self::Network {
            endpoint: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<tokio_serial::Error> for RouterError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::Serial {
            device: "unknown".to_string(),
            source: err,
        }
    }
}
