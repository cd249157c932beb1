//! Error types for the subscription engine.

use crate::types::SubscriptionId;
use thiserror::Error;

/// Main error type for subscription operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A configuration invariant was violated at construction time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A serialized snapshot could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Decode(e.to_string())
    }
}

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, RelayError>;
