//! UVE store client
//!
//! The store is the authoritative source of UVE contents. The alarm
//! generator reads it to bootstrap owned partitions, to fold in the
//! contributions of a collector that appears, and to resolve deletion races.
//!
//! ## Backends
//!
//! - **Memory** (default): In-process store, used standalone and in tests
//! - **HTTP**: JSON gateway in front of the per-collector UVE stores
//!
//! ## Usage
//!
//! ```no_run
//! use uve_alarmgen::store::{UveStore, memory::MemoryUveStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = MemoryUveStore::new(4);
//! let collectors = store.list_collectors().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod http;
pub mod memory;

pub use backend::{PartitionContents, UveStore};
pub use error::{StoreError, StoreResult};
