//! Error types for the tag gateway.

use thiserror::Error;

/// Unified error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration is invalid (bad address syntax, duplicate names, ...).
    ///
    /// Rejected synchronously at the point of mutation, before any runtime
    /// state is touched.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to establish or keep a connection to a device.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation requires a connected device.
    #[error("Not connected")]
    NotConnected,

    /// Protocol-level failure (malformed response, rejected request).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation not supported by this driver or protocol family.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Operation exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Delivery to a downstream sink failed.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a config error for an invalid field value.
    pub fn invalid(field: &str, detail: impl std::fmt::Display) -> Self {
        Self::Config(format!("invalid {}: {}", field, detail))
    }

    /// Check whether this error indicates loss of connectivity.
    ///
    /// Connectivity errors move the owning device into the `Error` state;
    /// other errors are recorded per value or per operation.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NotConnected | Self::Timeout(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
