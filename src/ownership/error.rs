//! Error types for coordination service operations

use std::fmt;

use crate::retry::Retryable;

pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinationError {
    /// Coordination service could not be reached (retryable)
    Unavailable(String),

    /// The session expired; partitions were reassigned
    SessionLost(String),

    /// Request rejected (unknown instance, partition out of range)
    Rejected(String),
}

impl fmt::Display for CoordinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationError::Unavailable(msg) => write!(f, "coordination service unavailable: {}", msg),
            CoordinationError::SessionLost(msg) => write!(f, "coordination session lost: {}", msg),
            CoordinationError::Rejected(msg) => write!(f, "coordination request rejected: {}", msg),
        }
    }
}

impl std::error::Error for CoordinationError {}

impl Retryable for CoordinationError {
    fn is_retryable(&self) -> bool {
        matches!(self, CoordinationError::Unavailable(_))
    }
}
