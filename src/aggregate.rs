//! Aggregate UVEs
//!
//! Per-table summaries of one struct field across every cached UVE that
//! carries the struct, e.g. the sum of `UveVirtualNetworkAgent.in_tpkts` over
//! all virtual networks.
//!
//! ## Operations
//!
//! - `sum`, `min`, `max` - over numeric field values
//! - `union` - distinct values; sequence values contribute their elements
//!
//! UVEs where the field is absent or `null` are skipped and not counted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{UveContents, UveKey};
use crate::rules::engine::json_eq;
use crate::rules::operand::{Bindings, resolve};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Sum,
    Union,
    Min,
    Max,
}

/// One configured aggregate
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub table: String,
    pub struct_name: String,

    /// Dotted path inside the struct
    pub field: String,

    pub op: AggregateOp,
}

/// Current value of an aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub table: String,
    pub struct_name: String,
    pub field: String,
    pub op: AggregateOp,
    pub value: Value,

    /// UVEs that contributed a value
    pub count: usize,
}

/// Tracks configured aggregates and their last reported values
///
/// Each UVE's contribution is kept per aggregate, so a change to one key
/// never rescans the cache.
#[derive(Debug, Default)]
pub struct Aggregator {
    configs: Vec<AggregationConfig>,
    contributions: BTreeMap<AggregationConfig, BTreeMap<UveKey, Value>>,
    last: BTreeMap<AggregationConfig, AggregateRecord>,
}

impl Aggregator {
    pub fn new(configs: Vec<AggregationConfig>) -> Self {
        Self {
            configs,
            contributions: BTreeMap::new(),
            last: BTreeMap::new(),
        }
    }

    pub fn configs(&self) -> &[AggregationConfig] {
        &self.configs
    }

    /// Last computed value of every aggregate
    pub fn records(&self) -> Vec<AggregateRecord> {
        self.last.values().cloned().collect()
    }

    /// Fold the current contents of `key` into its table's aggregates
    ///
    /// Returns the records whose value or count changed.
    pub fn update(&mut self, key: &UveKey, contents: &UveContents) -> Vec<AggregateRecord> {
        let mut changed = Vec::new();

        for cfg in self.configs.iter().filter(|cfg| cfg.table == key.table) {
            let value = contents
                .get(&cfg.struct_name)
                .and_then(|value| field_value(value, &cfg.field));
            let per_key = self.contributions.entry(cfg.clone()).or_default();

            let moved = match value {
                Some(value) => per_key.insert(key.clone(), value.clone()).as_ref() != Some(&value),
                None => per_key.remove(key).is_some(),
            };
            if moved {
                changed.extend(refresh(&mut self.last, cfg, per_key));
            }
        }

        changed
    }

    /// Drop whatever `key` contributed, e.g. when its partition leaves
    pub fn remove(&mut self, key: &UveKey) -> Vec<AggregateRecord> {
        self.update(key, &UveContents::new())
    }
}

/// Recombine one aggregate from its contributions
fn refresh(
    last: &mut BTreeMap<AggregationConfig, AggregateRecord>,
    cfg: &AggregationConfig,
    per_key: &BTreeMap<UveKey, Value>,
) -> Option<AggregateRecord> {
    let values: Vec<Value> = per_key.values().cloned().collect();
    let record = AggregateRecord {
        table: cfg.table.clone(),
        struct_name: cfg.struct_name.clone(),
        field: cfg.field.clone(),
        op: cfg.op,
        value: combine(cfg.op, &values),
        count: values.len(),
    };

    if last.get(cfg) == Some(&record) {
        return None;
    }
    last.insert(cfg.clone(), record.clone());
    Some(record)
}

fn field_value(struct_value: &Value, field: &str) -> Option<Value> {
    resolve(struct_value, field, &Bindings::new())
        .into_iter()
        .map(|(value, _)| value)
        .find(|value| !value.is_null())
}

fn combine(op: AggregateOp, values: &[Value]) -> Value {
    match op {
        AggregateOp::Sum => {
            if values.iter().all(|v| v.is_i64() || !v.is_number()) {
                Value::from(values.iter().filter_map(Value::as_i64).sum::<i64>())
            } else {
                Value::from(values.iter().filter_map(Value::as_f64).sum::<f64>())
            }
        }
        AggregateOp::Min => extreme(values, |a, b| a < b),
        AggregateOp::Max => extreme(values, |a, b| a > b),
        AggregateOp::Union => {
            let mut union: Vec<Value> = Vec::new();
            let items = values.iter().flat_map(|value| match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            });
            for item in items {
                if !union.iter().any(|seen| json_eq(seen, &item)) {
                    union.push(item);
                }
            }
            union.sort_by_key(|v| v.to_string());
            Value::Array(union)
        }
    }
}

fn extreme(values: &[Value], better: impl Fn(f64, f64) -> bool) -> Value {
    let mut best: Option<&Value> = None;
    for value in values {
        let Some(x) = value.as_f64() else {
            continue;
        };
        if best.and_then(Value::as_f64).is_none_or(|b| better(x, b)) {
            best = Some(value);
        }
    }
    best.cloned().unwrap_or(Value::Null)
}
