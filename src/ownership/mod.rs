//! Partition ownership over a coordination service
//!
//! Every alarm generator instance registers a session with the coordinator
//! and keeps it alive with heartbeats. The coordinator assigns a disjoint
//! set of partitions to each live session and reassigns the partitions of a
//! session that stops heartbeating.

pub mod coordinator;
pub mod error;
pub mod memory;

pub use coordinator::{Coordinator, SessionId};
pub use error::{CoordinationError, CoordinationResult};
