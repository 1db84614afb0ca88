//! Custom error types for the hub.
//!
//! This module defines the primary error type, `HubError`, using the `thiserror`
//! crate. It covers the failures that can surface while loading configuration,
//! binding the surface listener, opening serial lines and decoding frames.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the configuration sources.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine
//!   (duplicate identities, conflicting whitelists, invalid log level).
//! - **`Io`** / **`Bind`**: Socket and serial I/O failures. `Bind` is fatal for
//!   the surface channel only.
//! - **`UnknownPartition`**: A store operation named an identity that was never
//!   configured.
//! - **`Decode`**, **`NotAnObject`**, **`MissingIdentity`**, **`InvalidIdentity`**:
//!   Transient frame errors. Channels log these and carry on.
//!
//! None of these ever cross a channel boundary: every channel loop interprets
//! them locally and keeps running.

use crate::store::DeviceId;
use std::net::SocketAddr;
use thiserror::Error;

/// Convenience alias for results using the hub error type.
pub type HubResult<T> = std::result::Result<T, HubError>;

/// Primary error type for the hub.
#[derive(Error, Debug)]
pub enum HubError {
    /// Configuration sources could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is logically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Socket or serial I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The surface listener could not bind its address.
    #[error("Failed to bind surface listener to {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// A serial line could not be opened.
    #[error("Failed to open serial line {port}: {source}")]
    Serial {
        /// Serial path that was requested.
        port: String,
        /// Underlying driver error.
        source: tokio_serial::Error,
    },

    /// No partition exists for the identity.
    #[error("Unknown partition: {0}")]
    UnknownPartition(DeviceId),

    /// Payload was not valid JSON.
    #[error("Invalid JSON payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// Payload was valid JSON but not a key/value object.
    #[error("Payload is not a key/value object")]
    NotAnObject,

    /// Device payload lacks the identity field.
    #[error("Payload has no '{0}' field")]
    MissingIdentity(String),

    /// Device payload carries an identity value that cannot be used.
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(String),
}

impl From<figment::Error> for HubError {
    fn from(value: figment::Error) -> Self {
        HubError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_address() {
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let err = HubError::Bind {
            addr,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("127.0.0.1:50000"));
    }
}
