//! Coordination service trait definition

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::error::CoordinationResult;

/// Handle of one registration
pub type SessionId = u64;

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Register an instance and open a session
    async fn register(&self, instance_id: &str) -> CoordinationResult<SessionId>;

    /// Keep a session alive
    ///
    /// Fails with `SessionLost` once the session has expired.
    async fn heartbeat(&self, session: SessionId) -> CoordinationResult<()>;

    /// Partitions currently assigned to a session
    async fn assignment(&self, session: SessionId) -> CoordinationResult<BTreeSet<u32>>;

    /// Close a session, releasing its partitions
    async fn release(&self, session: SessionId) -> CoordinationResult<()>;

    /// Manually enable (`owned = true`) or withhold a partition
    ///
    /// A withheld partition is assigned to nobody until enabled again.
    async fn set_partition(&self, partition: u32, owned: bool) -> CoordinationResult<()>;
}
