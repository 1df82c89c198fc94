pub mod actors;
pub mod aggregate;
#[cfg(feature = "api")]
pub mod api;
pub mod asm;
pub mod bus;
pub mod cache;
pub mod config;
pub mod ownership;
pub mod retry;
pub mod rules;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Merged contents of one UVE: struct name to struct value
pub type UveContents = BTreeMap<String, Value>;

/// Identifier of a UVE, rendered as `table:name`
///
/// The name may itself contain `:`; only the first separator splits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UveKey {
    pub table: String,
    pub name: String,
}

impl UveKey {
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
        }
    }

    /// Partition this key hashes to when the cluster runs `partitions` partitions
    pub fn partition(&self, partitions: u32) -> u32 {
        partition_of(&self.to_string(), partitions)
    }
}

impl fmt::Display for UveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.name)
    }
}

impl FromStr for UveKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((table, name)) if !table.is_empty() && !name.is_empty() => {
                Ok(UveKey::new(table, name))
            }
            _ => Err(format!("invalid UVE key '{s}', expected 'table:name'")),
        }
    }
}

/// Stable partition mapping shared by producers and consumers
pub fn partition_of(key: &str, partitions: u32) -> u32 {
    if partitions == 0 {
        return 0;
    }
    crc32fast::hash(key.as_bytes()) % partitions
}

/// Collector address (format: "addr:port")
///
/// Serialized as its `addr:port` string so it can key JSON objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectorId {
    pub addr: String,
    pub port: u16,
}

impl CollectorId {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }
}

impl fmt::Display for CollectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl FromStr for CollectorId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid collector '{s}', expected 'addr:port'"))?;
        let port = port
            .parse()
            .map_err(|_| format!("invalid collector port in '{s}'"))?;
        Ok(CollectorId::new(addr, port))
    }
}

impl TryFrom<String> for CollectorId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CollectorId> for String {
    fn from(id: CollectorId) -> Self {
        id.to_string()
    }
}

/// A live collector together with its current generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorInfo {
    pub id: CollectorId,
    pub generation: String,
}

/// Snapshot of live collectors and their generations
pub type CollectorSet = BTreeMap<CollectorId, String>;

/// The `(collector, generation, generator)` that wrote a cached struct
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contributor {
    pub collector: CollectorId,
    pub generation: String,
    pub generator: String,
}

impl Contributor {
    pub fn new(collector: CollectorId, generation: impl Into<String>, generator: impl Into<String>) -> Self {
        Self {
            collector,
            generation: generation.into(),
            generator: generator.into(),
        }
    }
}

impl fmt::Display for Contributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.generator, self.collector, self.generation)
    }
}
