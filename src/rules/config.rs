//! Alarm rule documents
//!
//! ```json
//! {
//!   "name": "process-status",
//!   "uve_tables": ["ObjectVRouter"],
//!   "severity": "major",
//!   "or_list": [
//!     [{"operand1": "NodeStatus.process_info.process_state",
//!       "operation": "!=",
//!       "operand2": "\"PROCESS_STATE_RUNNING\"",
//!       "variables": ["NodeStatus.process_info.process_name"]}]
//!   ],
//!   "active_timer_s": 5
//! }
//! ```
//!
//! An `and_list` may also be written as `{"and_list": [...]}`, and operand2
//! as `{"uve_attribute": "path"}` or `{"json_value": "<json text>"}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RuleError;
use crate::UveKey;

/// Comparison applied between operand1 and operand2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "range")]
    Range,
    #[serde(rename = "size==")]
    SizeEq,
    #[serde(rename = "size!=")]
    SizeNe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Eq => "==",
            Operation::Ne => "!=",
            Operation::Lt => "<",
            Operation::Le => "<=",
            Operation::Gt => ">",
            Operation::Ge => ">=",
            Operation::In => "in",
            Operation::NotIn => "not in",
            Operation::Range => "range",
            Operation::SizeEq => "size==",
            Operation::SizeNe => "size!=",
        };
        write!(f, "{s}")
    }
}

/// Right-hand side of an expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOperand2", into = "RawOperand2")]
pub enum Operand2 {
    /// Literal JSON value
    Json(Value),

    /// Dotted path into the UVE
    Path(String),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawOperand2 {
    Text(String),
    Attribute { uve_attribute: String },
    Json { json_value: String },
    Literal(Value),
}

impl TryFrom<RawOperand2> for Operand2 {
    type Error = String;

    fn try_from(raw: RawOperand2) -> Result<Self, Self::Error> {
        match raw {
            RawOperand2::Text(text) => Ok(match serde_json::from_str(&text) {
                Ok(value) => Operand2::Json(value),
                Err(_) => Operand2::Path(text),
            }),
            RawOperand2::Attribute { uve_attribute } => Ok(Operand2::Path(uve_attribute)),
            RawOperand2::Json { json_value } => serde_json::from_str(&json_value)
                .map(Operand2::Json)
                .map_err(|e| format!("invalid json_value '{json_value}': {e}")),
            RawOperand2::Literal(value) => Ok(Operand2::Json(value)),
        }
    }
}

impl From<Operand2> for RawOperand2 {
    fn from(operand: Operand2) -> Self {
        match operand {
            Operand2::Json(value) => RawOperand2::Json {
                json_value: value.to_string(),
            },
            Operand2::Path(path) => RawOperand2::Attribute { uve_attribute: path },
        }
    }
}

/// One condition of an and_list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmExpression {
    pub operand1: String,
    pub operation: Operation,
    pub operand2: Operand2,

    /// Extra paths reported with each match
    #[serde(default)]
    pub variables: Vec<String>,
}

impl AlarmExpression {
    pub fn new(operand1: &str, operation: Operation, operand2: Operand2) -> Self {
        Self {
            operand1: operand1.to_string(),
            operation,
            operand2,
            variables: Vec::new(),
        }
    }

    pub fn with_variables(mut self, variables: &[&str]) -> Self {
        self.variables = variables.iter().map(|v| v.to_string()).collect();
        self
    }
}

/// Conditions that must all hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawAndList", into = "Vec<AlarmExpression>")]
pub struct AndList(pub Vec<AlarmExpression>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAndList {
    Plain(Vec<AlarmExpression>),
    Wrapped { and_list: Vec<AlarmExpression> },
}

impl From<RawAndList> for AndList {
    fn from(raw: RawAndList) -> Self {
        match raw {
            RawAndList::Plain(list) | RawAndList::Wrapped { and_list: list } => AndList(list),
        }
    }
}

impl From<AndList> for Vec<AlarmExpression> {
    fn from(list: AndList) -> Self {
        list.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    #[default]
    Major,
    Minor,
}

/// Which UVEs an alarm may be raised on
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentScope {
    #[default]
    Global,

    /// Fully-qualified project name, e.g. `default-domain:admin`
    Project(String),
}

/// A configured alarm rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub name: String,

    /// Tables (`table`) or single UVEs (`table:name`) the alarm applies to
    pub uve_tables: Vec<String>,

    #[serde(default)]
    pub severity: Severity,

    #[serde(default)]
    pub parent_scope: ParentScope,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub or_list: Vec<AndList>,

    #[serde(default)]
    pub active_timer_s: u64,

    #[serde(default)]
    pub idle_timer_s: u64,

    #[serde(default)]
    pub freq_check_times: u32,

    #[serde(default)]
    pub freq_check_seconds: u64,

    #[serde(default)]
    pub freq_exceeded_check: bool,
}

impl AlarmConfig {
    pub fn new(name: &str, uve_tables: &[&str], or_list: Vec<Vec<AlarmExpression>>) -> Self {
        Self {
            name: name.to_string(),
            uve_tables: uve_tables.iter().map(|t| t.to_string()).collect(),
            severity: Severity::default(),
            parent_scope: ParentScope::default(),
            description: None,
            or_list: or_list.into_iter().map(AndList).collect(),
            active_timer_s: 0,
            idle_timer_s: 0,
            freq_check_times: 0,
            freq_check_seconds: 0,
            freq_exceeded_check: false,
        }
    }

    /// Whether the alarm is configured for this UVE
    pub fn applies_to(&self, key: &UveKey) -> bool {
        self.uve_tables.iter().any(|entry| match entry.split_once(':') {
            Some((table, name)) => table == key.table && name == key.name,
            None => entry == &key.table,
        })
    }

    /// Tables named by `uve_tables`
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.uve_tables
            .iter()
            .map(|entry| entry.split_once(':').map_or(entry.as_str(), |(table, _)| table))
    }

    /// Reject rule documents the engine cannot evaluate
    pub fn validate(&self) -> Result<(), RuleError> {
        let invalid = |reason: String| RuleError::InvalidConfig {
            alarm: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("empty alarm name".to_string()));
        }
        if self.uve_tables.is_empty() {
            return Err(invalid("no uve_tables".to_string()));
        }
        if self.or_list.is_empty() {
            return Err(invalid("empty or_list".to_string()));
        }
        if self.freq_exceeded_check && (self.freq_check_times == 0 || self.freq_check_seconds == 0) {
            return Err(invalid(
                "freq_exceeded_check needs freq_check_times and freq_check_seconds".to_string(),
            ));
        }

        for and_list in &self.or_list {
            if and_list.0.is_empty() {
                return Err(invalid("empty and_list".to_string()));
            }
            for expr in &and_list.0 {
                if expr.operand1.is_empty() || expr.operand1.split('.').any(str::is_empty) {
                    return Err(invalid(format!("bad operand1 '{}'", expr.operand1)));
                }
                match (&expr.operation, &expr.operand2) {
                    (Operation::Range, Operand2::Json(Value::Array(bounds)))
                        if bounds.len() == 2 && bounds.iter().all(Value::is_number) => {}
                    (Operation::Range, _) => {
                        return Err(invalid("range needs a literal [lo, hi]".to_string()));
                    }
                    (Operation::SizeEq | Operation::SizeNe, Operand2::Json(v)) if v.is_u64() => {}
                    (Operation::SizeEq | Operation::SizeNe, _) => {
                        return Err(invalid(format!("{} needs a literal count", expr.operation)));
                    }
                    (_, Operand2::Path(path)) if path.split('.').any(str::is_empty) => {
                        return Err(invalid(format!("bad operand2 '{path}'")));
                    }
                    _ => {}
                }
                if let Some(var) = expr.variables.iter().find(|v| v.is_empty()) {
                    return Err(invalid(format!("bad variable '{var}'")));
                }
            }
        }

        Ok(())
    }
}
