//! Controller error types.

use thiserror::Error;

use crate::client::ApiError;

/// Reasons a reconciliation pass can fail.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("API request failed: {0}")]
    Api(#[from] ApiError),

    #[error("invalid {kind} {name:?}: {reason}")]
    InvalidObject {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

impl ControllerError {
    /// Whether requeueing the key can help. A malformed object stays
    /// malformed until it changes, which enqueues it again anyway.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControllerError::Api(_))
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
