//! Route handlers, one module per resource

pub mod alarms;
pub mod health;
pub mod partitions;
pub mod stats;
pub mod uves;
