//! Alarm rule engine
//!
//! Rules are data: an `AlarmConfig` holds an `or_list` of `and_list`s of
//! expressions over dotted paths into the UVE. `evaluate` interprets a rule
//! against one UVE and returns the firing and_lists, or `None` when the
//! alarm does not apply.
//!
//! ```text
//! AlarmConfig ─┐
//!              ├─▶ evaluate ─▶ Option<MatchSet> ─▶ alarm state machine
//! UveContents ─┘
//! ```

pub mod config;
pub mod engine;
pub mod matches;
pub mod operand;

use std::fmt;

pub use config::{AlarmConfig, AlarmExpression, AndList, Operand2, Operation, ParentScope, Severity};
pub use engine::evaluate;
pub use matches::{AlarmMatch, AndListMatch, ConditionMatch, MatchSet};

/// Errors in alarm rule documents
#[derive(Debug, Clone, PartialEq)]
pub enum RuleError {
    InvalidConfig { alarm: String, reason: String },
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::InvalidConfig { alarm, reason } => {
                write!(f, "invalid alarm config '{}': {}", alarm, reason)
            }
        }
    }
}

impl std::error::Error for RuleError {}
