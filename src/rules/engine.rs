//! Rule evaluation
//!
//! `evaluate` is a pure function of the rule document and the UVE contents.
//!
//! An and_list is evaluated left to right. Each expression is resolved in
//! every binding environment the previous expressions left behind, so
//! iteration steps shared between expressions (`A.*.C` and `A.*.D`) refer
//! to the same child. The and_list fires if at least one environment
//! survives all expressions; each condition then reports the matches that
//! belong to a surviving environment.
//!
//! A condition whose operand starts from a struct the UVE does not carry
//! never matches; a missing field below a present struct resolves to `null`.

use std::collections::BTreeMap;

use serde_json::Value;

use super::config::{AlarmConfig, AlarmExpression, AndList, Operand2, Operation, ParentScope};
use super::matches::{AlarmMatch, AndListMatch, ConditionMatch, MatchSet};
use super::operand::{Bindings, is_subset, merge, resolve};
use crate::{UveContents, UveKey};

/// Evaluate an alarm rule against one UVE
///
/// Returns `None` when the alarm does not apply to the UVE or no and_list
/// fires.
pub fn evaluate(cfg: &AlarmConfig, key: &UveKey, contents: &UveContents) -> Option<MatchSet> {
    if !cfg.applies_to(key) || !in_scope(&cfg.parent_scope, key, contents) {
        return None;
    }

    let root = Value::Object(
        contents
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    );

    let fired: Vec<AndListMatch> = cfg
        .or_list
        .iter()
        .filter_map(|and_list| evaluate_and_list(and_list, &root))
        .collect();

    if fired.is_empty() {
        None
    } else {
        Some(MatchSet(fired))
    }
}

/// Project scoping: the UVE must belong to the project by name, or carry an
/// interface of the project
pub fn in_scope(scope: &ParentScope, key: &UveKey, contents: &UveContents) -> bool {
    let ParentScope::Project(fq_name) = scope else {
        return true;
    };

    let owned = |name: &str| {
        name.strip_prefix(fq_name.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
    };

    if owned(&key.name) {
        return true;
    }

    contents.values().any(|value| {
        value
            .get("interface_list")
            .and_then(Value::as_array)
            .is_some_and(|interfaces| interfaces.iter().filter_map(Value::as_str).any(owned))
    })
}

fn evaluate_and_list(and_list: &AndList, root: &Value) -> Option<AndListMatch> {
    let mut envs = vec![Bindings::new()];
    let mut per_condition: Vec<Vec<AlarmMatch>> = Vec::with_capacity(and_list.0.len());

    for expr in &and_list.0 {
        let mut matches = Vec::new();
        for env in &envs {
            matches.extend(evaluate_expression(expr, root, env));
        }
        if matches.is_empty() {
            return None;
        }
        envs = matches.iter().map(|m| m.bindings.clone()).collect();
        envs.sort_by_cached_key(|b| serde_json::to_string(b).unwrap_or_default());
        envs.dedup();
        per_condition.push(matches);
    }

    let conditions = and_list
        .0
        .iter()
        .zip(per_condition)
        .map(|(expr, matches)| {
            let surviving = matches
                .into_iter()
                .filter(|m| envs.iter().any(|env| is_subset(&m.bindings, env)))
                .collect();
            ConditionMatch::new(expr.clone(), surviving)
        })
        .collect();

    Some(AndListMatch { and_list: conditions })
}

/// Whether the struct a path starts from is carried by the UVE
fn carried(root: &Value, path: &str) -> bool {
    let head = path.split('.').next().unwrap_or(path);
    matches!(head, "*" | "__key" | "__value") || root.get(head).is_some()
}

fn evaluate_expression(expr: &AlarmExpression, root: &Value, env: &Bindings) -> Vec<AlarmMatch> {
    let mut matches = Vec::new();

    // A condition on a struct the UVE lacks cannot be evaluated
    let operand2_carried = match &expr.operand2 {
        Operand2::Path(path) => carried(root, path),
        Operand2::Json(_) => true,
    };
    if !carried(root, &expr.operand1) || !operand2_carried {
        return matches;
    }

    for (lhs, lhs_bindings) in resolve(root, &expr.operand1, env) {
        let rhs_pairs = match &expr.operand2 {
            Operand2::Json(value) => vec![(value.clone(), lhs_bindings.clone())],
            Operand2::Path(path) => resolve(root, path, &lhs_bindings),
        };

        for (rhs, rhs_bindings) in rhs_pairs {
            let Some(bindings) = merge(&lhs_bindings, &rhs_bindings) else {
                continue;
            };
            if !compare(expr.operation, &lhs, &rhs) {
                continue;
            }

            let variables_json = expr
                .variables
                .iter()
                .map(|var| (var.clone(), resolve_variable(root, var, &bindings)))
                .collect::<BTreeMap<_, _>>();

            matches.push(AlarmMatch {
                op1_json: lhs.clone(),
                op2_json: matches!(expr.operand2, Operand2::Path(_)).then(|| rhs.clone()),
                variables_json,
                bindings,
            });
        }
    }

    matches
}

fn resolve_variable(root: &Value, path: &str, bindings: &Bindings) -> Value {
    let mut values: Vec<Value> = resolve(root, path, bindings).into_iter().map(|(v, _)| v).collect();
    match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    }
}

/// JSON equality treating numerically equal numbers as equal
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

fn size(value: &Value) -> Option<u64> {
    match value {
        Value::Array(items) => Some(items.len() as u64),
        Value::Object(map) => Some(map.len() as u64),
        _ => None,
    }
}

/// Apply one operation to resolved operands
pub fn compare(operation: Operation, lhs: &Value, rhs: &Value) -> bool {
    let numbers = || Some((lhs.as_f64()?, rhs.as_f64()?));

    match operation {
        Operation::Eq => json_eq(lhs, rhs),
        Operation::Ne => !json_eq(lhs, rhs),
        Operation::Lt => numbers().is_some_and(|(l, r)| l < r),
        Operation::Le => numbers().is_some_and(|(l, r)| l <= r),
        Operation::Gt => numbers().is_some_and(|(l, r)| l > r),
        Operation::Ge => numbers().is_some_and(|(l, r)| l >= r),
        Operation::In => rhs
            .as_array()
            .is_some_and(|items| items.iter().any(|item| json_eq(lhs, item))),
        Operation::NotIn => match rhs {
            Value::Null => true,
            Value::Array(items) => !items.iter().any(|item| json_eq(lhs, item)),
            _ => false,
        },
        Operation::Range => match (lhs.as_f64(), rhs.as_array().map(Vec::as_slice)) {
            (Some(x), Some([lo, hi])) => match (lo.as_f64(), hi.as_f64()) {
                (Some(lo), Some(hi)) => lo <= x && x <= hi,
                _ => false,
            },
            _ => false,
        },
        Operation::SizeEq => match (size(lhs), rhs.as_u64()) {
            (Some(n), Some(expected)) => n == expected,
            _ => false,
        },
        Operation::SizeNe => match (lhs, size(lhs), rhs.as_u64()) {
            (Value::Null, _, _) => true,
            (_, Some(n), Some(expected)) => n != expected,
            _ => false,
        },
    }
}
