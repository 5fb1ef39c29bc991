//! Error types for the sidecar client.

use std::time::Duration;

use crate::validation::{BatchValidationError, ValidationError};

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while delivering events to a sidecar.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Sidecar URL could not be built from the options.
    #[error("invalid sidecar address: {0}")]
    InvalidAddress(String),

    /// Sidecar never answered the health check.
    #[error("sidecar at {url} not healthy after {elapsed:?}")]
    Timeout { url: String, elapsed: Duration },

    /// The event failed local validation; nothing was sent.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// One event of a batch failed local validation; nothing was sent.
    #[error("validation failed: {0}")]
    BatchValidation(#[from] BatchValidationError),

    /// HTTP-level failure (connect, TLS, body).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The sidecar answered with something other than 201.
    #[error("sidecar rejected events ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl ClientError {
    /// Returns true if the error was raised before any network call.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            ClientError::Validation(_) | ClientError::BatchValidation(_)
        )
    }

    /// Returns true if this is a connection or timeout error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ClientError::Timeout { .. } => true,
            ClientError::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    /// HTTP status the sidecar answered with, if it answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Rejected { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
