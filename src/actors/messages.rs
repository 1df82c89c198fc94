//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Events**: Broadcast notifications published to multiple subscribers
//! 3. **Work items**: Bounded mpsc queues between pipeline stages (backpressure)

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::aggregate::AggregateRecord;
use crate::asm::{AckResult, Micros, TimerOutcome, UveAlarms};
use crate::cache::PartitionInfo;
use crate::rules::{AlarmConfig, RuleError};
use crate::{CollectorId, CollectorSet, UveKey};

/// A key whose contents changed and must be re-evaluated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReevalRequest {
    pub key: UveKey,
    pub partition: u32,
}

/// Record published on the alarm output channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlarmOutput {
    /// Current public alarms of a UVE
    Update(UveAlarms),

    /// The UVE has no public alarms anymore
    Clear { key: UveKey },

    /// An aggregate UVE changed
    Aggregate(AggregateRecord),
}

impl AlarmOutput {
    /// Records with the same identity replace each other downstream
    pub fn identity(&self) -> String {
        match self {
            AlarmOutput::Update(alarms) => format!("alarm|{}", alarms.key),
            AlarmOutput::Clear { key } => format!("alarm|{key}"),
            AlarmOutput::Aggregate(record) => format!(
                "aggregate|{}|{}|{}|{:?}",
                record.table, record.struct_name, record.field, record.op
            ),
        }
    }
}

/// Lifecycle phase of a partition worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPhase {
    Bootstrapping,
    Streaming,
}

/// Snapshot of a partition worker
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub partition: u32,
    pub phase: PartitionPhase,

    /// Next offset to consume
    pub offset: u64,

    /// Collectors and generations applied in this partition
    pub collectors: CollectorSet,

    /// Collectors whose contributions are not yet bootstrapped
    pub pending: Vec<CollectorId>,

    pub info: Option<PartitionInfo>,
    pub keys: usize,
}

/// Commands that can be sent to a PartitionWorker
#[derive(Debug)]
pub enum PartitionCommand {
    GetStatus {
        respond_to: oneshot::Sender<PartitionStatus>,
    },

    /// Relinquish the partition
    ///
    /// The worker finishes the batch in hand, drops the partition from the
    /// cache and responds with the keys that were removed.
    Stop {
        respond_to: oneshot::Sender<Vec<UveKey>>,
    },
}

/// Commands that can be sent to the CollectorWatcher
#[derive(Debug)]
pub enum WatcherCommand {
    /// Poll the store immediately
    PollNow {
        respond_to: oneshot::Sender<anyhow::Result<CollectorSet>>,
    },

    Shutdown,
}

/// Ownership changes reported to the PartitionManager
#[derive(Debug)]
pub enum OwnershipEvent {
    /// The owned partition set changed
    ///
    /// `ack` must be sent once state for released partitions is gone.
    Owned {
        partitions: BTreeSet<u32>,
        ack: oneshot::Sender<()>,
    },

    /// The coordination session was lost for longer than the grace period
    Fatal { reason: String },
}

/// Commands that can be sent to the OwnershipActor
#[derive(Debug)]
pub enum OwnershipCommand {
    /// Enable or withhold a partition at the coordinator
    SetPartition {
        partition: u32,
        owned: bool,
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    GetOwned {
        respond_to: oneshot::Sender<BTreeSet<u32>>,
    },

    /// Release the session and stop
    Shutdown,
}

/// Commands that can be sent to the PartitionManager
#[derive(Debug)]
pub enum ManagerCommand {
    GetStatus {
        respond_to: oneshot::Sender<Vec<PartitionStatus>>,
    },

    /// Stop every partition worker
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Alarm actor statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlarmStats {
    pub configs: usize,
    pub machines: usize,
    pub alarmed_uves: usize,
    pub evaluations: u64,
}

/// Commands that can be sent to the AlarmActor
#[derive(Debug)]
pub enum AlarmCommand {
    /// Create or replace an alarm rule, then re-sweep the cache
    SetConfig {
        config: AlarmConfig,
        respond_to: oneshot::Sender<Result<(), RuleError>>,
    },

    /// Delete an alarm rule; responds whether it existed
    DeleteConfig {
        name: String,
        respond_to: oneshot::Sender<bool>,
    },

    GetConfigs {
        respond_to: oneshot::Sender<Vec<AlarmConfig>>,
    },

    Ack {
        key: UveKey,
        alarm_name: String,
        timestamp: Micros,
        respond_to: oneshot::Sender<AckResult>,
    },

    /// Tear down alarms of keys that left with a released partition
    DropPartition {
        partition: u32,
        keys: Vec<UveKey>,
        respond_to: oneshot::Sender<()>,
    },

    GetAlarms {
        respond_to: oneshot::Sender<Vec<UveAlarms>>,
    },

    GetAggregates {
        respond_to: oneshot::Sender<Vec<AggregateRecord>>,
    },

    /// Run the timer pass now (at `now`, or the current time)
    RunTimers {
        now: Option<Micros>,
        respond_to: oneshot::Sender<TimerOutcome>,
    },

    /// Process every queued re-evaluation, then respond
    Drain { respond_to: oneshot::Sender<()> },

    GetStats {
        respond_to: oneshot::Sender<AlarmStats>,
    },

    Shutdown,
}

/// Output actor statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutputStats {
    pub emitted: u64,
    pub suppressed: u64,
    pub dropped: u64,
    pub webhook_sent: u64,

    /// Identities with a published record remembered for de-duplication
    pub tracked: usize,
}

/// Commands that can be sent to the OutputActor
#[derive(Debug)]
pub enum OutputCommand {
    GetStats {
        respond_to: oneshot::Sender<OutputStats>,
    },

    /// Emit everything queued, then respond
    Flush { respond_to: oneshot::Sender<()> },

    /// Flush within the shutdown deadline and stop
    Shutdown { respond_to: oneshot::Sender<()> },
}
