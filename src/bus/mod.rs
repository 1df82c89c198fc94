//! Notification bus
//!
//! A partitioned, append-only log of UVE change notifications. Each record
//! is keyed `<table:name>|<struct>|<generator>|<addr>:<port>`; the value is
//! the JSON struct contents, or empty when the contribution is gone.
//!
//! ## Message Flow
//!
//! ```text
//! collector ──publish──▶ [partition log] ──fetch──▶ PartitionWorker ──commit──▶ offset
//! ```

pub mod codec;
pub mod error;
pub mod memory;
pub mod source;

pub use codec::{Notification, RawRecord};
pub use error::{BusError, BusResult};
pub use source::NotificationSource;
