//! Error types for UVE store operations

use std::fmt;

use crate::retry::Retryable;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the UVE store
#[derive(Debug)]
pub enum StoreError {
    /// Store endpoint could not be reached (retryable)
    Unavailable(String),

    /// Requested entity does not exist (treated as empty by callers)
    NotFound(String),

    /// Response could not be decoded
    Malformed(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "UVE store unavailable: {}", msg),
            StoreError::NotFound(msg) => write!(f, "not found in UVE store: {}", msg),
            StoreError::Malformed(msg) => write!(f, "malformed UVE store response: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Malformed(err.to_string())
        } else if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            StoreError::NotFound(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Malformed(err.to_string())
    }
}
