//! API shared state containing actor handles

use std::sync::Arc;

use crate::actors::{
    alarm::AlarmHandle, manager::PartitionManagerHandle, output::OutputHandle,
    ownership::OwnershipHandle,
};
use crate::cache::UveCache;

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    /// UVE cache, read directly for UVE lookups
    pub cache: Arc<UveCache>,

    /// Alarm actor for alarm records, acks and rule changes
    pub alarm: AlarmHandle,

    /// Output actor for counters and the alarm stream
    pub output: OutputHandle,

    /// Partition manager for worker status
    pub manager: PartitionManagerHandle,

    /// Ownership actor for manual partition control
    pub ownership: OwnershipHandle,
}

impl ApiState {
    pub fn new(
        cache: Arc<UveCache>,
        alarm: AlarmHandle,
        output: OutputHandle,
        manager: PartitionManagerHandle,
        ownership: OwnershipHandle,
    ) -> Self {
        Self {
            cache,
            alarm,
            output,
            manager,
            ownership,
        }
    }
}
