//! Error types for the admission-control layer.

use std::time::Duration;
use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The shared state store could not execute the atomic operation.
    #[error("Shared state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The downstream call did not complete within its time budget.
    #[error("Forward timed out after {0:?}")]
    ForwardTimeout(Duration),

    /// The downstream call failed before producing a response.
    #[error("Forward connection error: {0}")]
    ForwardConnection(String),

    /// The tier resolver has no configuration for this principal.
    #[error("Unknown principal: {0}")]
    PrincipalUnknown(String),

    /// A rate limit configuration with a non-positive rate or burst.
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Response cache backend errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Payload (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether the limiter's backing store failed, as opposed to a denial.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, GatewayError::StoreUnavailable(_))
    }

    /// Whether this is a failure of the downstream call.
    pub fn is_forward_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::ForwardTimeout(_) | GatewayError::ForwardConnection(_)
        )
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
