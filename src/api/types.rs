//! Request and response bodies of the introspection endpoint

use serde::{Deserialize, Serialize};

use crate::actors::messages::{AlarmStats, OutputStats, PartitionStatus};
use crate::aggregate::AggregateRecord;
use crate::asm::{AckResult, Micros, UveAlarms};
use crate::cache::CacheStats;
use crate::UveContents;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub timestamp: String,
    pub owned_partitions: Vec<u32>,
    pub cache: CacheStats,
    pub alarms: AlarmStats,
    pub output: OutputStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionsResponse {
    pub partition_count: u32,
    pub partitions: Vec<PartitionStatus>,
}

/// Body of `POST /api/v1/partitions/:id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPartitionRequest {
    pub owned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UveNamesResponse {
    pub table: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UveResponse {
    pub key: String,
    pub contents: UveContents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmsResponse {
    pub alarms: Vec<UveAlarms>,
    pub aggregates: Vec<AggregateRecord>,
}

/// Body of `POST /api/v1/alarms/ack`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub table: String,
    pub name: String,
    pub alarm_name: String,

    /// Timestamp of the alarm record being acknowledged
    pub timestamp: Micros,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub result: AckResult,
}
