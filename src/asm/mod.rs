//! Alarm state machines
//!
//! One `AlarmStateMachine` per `(table, name, alarm_name)`, kept in an
//! `AlarmTable` owned by the alarm actor.
//!
//! ## States
//!
//! ```text
//! Idle ──set──▶ SoakActive ──active timer──▶ Active
//! Idle ──set (active_timer_s = 0)──▶ Active
//! SoakActive ──clear──▶ Idle
//! Active ──clear (idle_timer_s = 0)──▶ Idle
//! Active ──clear──▶ SoakIdle ──idle timer──▶ Idle
//! SoakIdle ──set──▶ Active
//! Idle ──delete timer──▶ (removed)
//! ```
//!
//! An alarm record is public while the machine is `Active` or `SoakIdle`.
//! All times are wall-clock microseconds supplied by the caller.

pub mod machine;
pub mod record;
pub mod table;

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use machine::{AlarmStateMachine, AsmEvent};
pub use record::{AlarmRecord, UveAlarms};
pub use table::{AlarmTable, TimerOutcome};

/// Microseconds since the Unix epoch
pub type Micros = u64;

pub const MICROS_PER_SEC: Micros = 1_000_000;

/// Time an `Idle` machine lingers before removal
pub const DELETE_DELAY: Micros = MICROS_PER_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Idle,
    SoakActive,
    Active,
    SoakIdle,
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlarmState::Idle => "idle",
            AlarmState::SoakActive => "soak_active",
            AlarmState::Active => "active",
            AlarmState::SoakIdle => "soak_idle",
        };
        write!(f, "{s}")
    }
}

/// Outcome of the ack RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckResult {
    Success,
    NotPresent,
    InvalidRequest,
}

/// Wall-clock microseconds derived from the tokio clock
///
/// Follows `tokio::time::pause`/`advance`, so soak timers can be driven
/// from tests.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall_origin: Micros,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            wall_origin: Utc::now().timestamp_micros().max(0) as Micros,
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Micros {
        self.wall_origin + self.origin.elapsed().as_micros() as Micros
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
