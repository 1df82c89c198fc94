//! Public alarm records

use serde::{Deserialize, Serialize};

use super::Micros;
use crate::UveKey;
use crate::rules::{MatchSet, Severity};

/// The published state of one alarm on one UVE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub table: String,
    pub name: String,
    pub alarm_name: String,
    pub severity: Severity,

    /// Firing and_lists
    pub or_list: MatchSet,

    pub ack: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_timestamp: Option<Micros>,

    /// Time the match set was last reported; the ack RPC must echo it
    pub timestamp: Micros,
}

/// Every public alarm of one UVE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UveAlarms {
    pub key: UveKey,
    pub alarms: Vec<AlarmRecord>,
}
