//! Actor-based alarm generator core
//!
//! Each actor runs as an independent async task communicating via Tokio
//! channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!   OwnershipActor ──OwnershipEvent──▶ PartitionManager
//!   (coordinator session)                 │ spawns / stops
//!                                         ▼
//!   CollectorWatcher ──watch──▶ PartitionWorker (one per owned partition)
//!   (live collectors)             │  bootstrap from UveStore
//!                                 │  stream from NotificationSource
//!                                 │  writes its slice of UveCache
//!                                 ▼
//!                          ReevalRequest (bounded mpsc)
//!                                 ▼
//!                            AlarmActor ◀── timer tick, config, ack
//!                                 │ AlarmOutput
//!                                 ▼
//!                            OutputActor ──▶ broadcast stream, webhook
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Work queues**: bounded mpsc channels between pipeline stages
//! 3. **Request/Response**: oneshot channels for synchronous queries
//! 4. **Snapshots**: watch channels for the live collector set and fatal state

pub mod alarm;
pub mod collector;
pub mod manager;
pub mod messages;
pub mod output;
pub mod ownership;
pub mod partition;
