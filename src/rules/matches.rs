//! Rule match sets and their canonical form

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::{AlarmExpression, Operation};
use super::operand::Bindings;

/// One satisfied instance of a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmMatch {
    pub op1_json: Value,

    /// Present only when operand2 is a path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op2_json: Option<Value>,

    #[serde(default)]
    pub variables_json: BTreeMap<String, Value>,

    /// Iteration bindings this match was produced under
    #[serde(skip)]
    pub bindings: Bindings,
}

impl AlarmMatch {
    fn sort_key(&self) -> (String, String) {
        (
            serde_json::to_string(&self.bindings).unwrap_or_default(),
            serde_json::to_string(self).unwrap_or_default(),
        )
    }
}

/// Matches of one condition of a firing and_list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionMatch {
    pub condition: AlarmExpression,
    pub matches: Vec<AlarmMatch>,
}

impl ConditionMatch {
    /// Build with matches in canonical order, duplicates removed
    pub fn new(condition: AlarmExpression, mut matches: Vec<AlarmMatch>) -> Self {
        matches.sort_by_cached_key(AlarmMatch::sort_key);
        matches.dedup();
        Self { condition, matches }
    }
}

/// A firing and_list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AndListMatch {
    pub and_list: Vec<ConditionMatch>,
}

/// The satisfied and_lists of an alarm (its `or_list` matches)
///
/// Equality is byte equality of the canonical encoding: ack state and
/// timestamps are not part of a match set, and operand2 of `range`
/// conditions is left out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchSet(pub Vec<AndListMatch>);

impl MatchSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical JSON encoding
    pub fn canonical(&self) -> String {
        let mut encoded = serde_json::to_value(self).unwrap_or(Value::Null);

        if let Value::Array(and_lists) = &mut encoded {
            for (and_list, original) in and_lists.iter_mut().zip(&self.0) {
                let Some(Value::Array(conditions)) = and_list.get_mut("and_list") else {
                    continue;
                };
                for (condition, original) in conditions.iter_mut().zip(&original.and_list) {
                    if original.condition.operation != Operation::Range {
                        continue;
                    }
                    if let Some(Value::Object(expr)) = condition.get_mut("condition") {
                        expr.remove("operand2");
                    }
                    if let Some(Value::Array(matches)) = condition.get_mut("matches") {
                        for m in matches.iter_mut().filter_map(Value::as_object_mut) {
                            m.remove("op2_json");
                        }
                    }
                }
            }
        }

        encoded.to_string()
    }
}

impl PartialEq for MatchSet {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for MatchSet {}
