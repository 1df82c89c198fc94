//! Error types for notification bus operations

use std::fmt;

use crate::retry::Retryable;

/// Result type alias for bus operations
pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug)]
pub enum BusError {
    /// Broker could not be reached (retryable)
    Unavailable(String),

    /// Record key or value could not be decoded
    Malformed(String),

    /// Partition is not served by this bus
    UnknownPartition(u32),

    /// The bus was shut down
    Closed,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Unavailable(msg) => write!(f, "notification bus unavailable: {}", msg),
            BusError::Malformed(msg) => write!(f, "malformed notification: {}", msg),
            BusError::UnknownPartition(p) => write!(f, "unknown partition {}", p),
            BusError::Closed => write!(f, "notification bus closed"),
        }
    }
}

impl std::error::Error for BusError {}

impl Retryable for BusError {
    fn is_retryable(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}
