//! Notification source trait definition

use async_trait::async_trait;

use super::codec::RawRecord;
use super::error::BusResult;

/// Per-partition consumer side of the notification bus
///
/// Offsets are per partition and dense. `committed_offset` is the offset of
/// the next record to deliver after a restart.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Wait for records at or after `from_offset`, returning at most `max`
    ///
    /// Must be cancel-safe: dropping the future loses no records.
    async fn fetch(&self, partition: u32, from_offset: u64, max: usize) -> BusResult<Vec<RawRecord>>;

    /// Offset consumption resumes from
    async fn committed_offset(&self, partition: u32) -> BusResult<u64>;

    /// Record that everything before `offset` was applied
    async fn commit(&self, partition: u32, offset: u64) -> BusResult<()>;
}
