//! Dotted-path operand interpreter
//!
//! A path such as `A.*.C` or `NodeStatus.process_info.process_state` is
//! resolved against the merged UVE contents. Iteration steps produce one
//! result per child, each carrying the bindings that identify which child
//! was taken.
//!
//! ## Components
//!
//! - literal `c` - select field `c`; on a sequence, iterate it and select `c`
//!   from each element
//! - `*` / `__value` - iterate a mapping or sequence, yielding each child
//! - `__key` - iterate, yielding each child's key (or index)
//!
//! String values that hold JSON text are decoded before they are walked or
//! compared.
//!
//! A binding is keyed by the path of the container that was iterated, with
//! iteration steps normalised to `*`: `A.*.C` and `A.__key` both bind `A`.
//! Two results are compatible when they agree on every shared binding.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde_json::Value;

/// Container path -> chosen child (key string or index)
pub type Bindings = BTreeMap<String, Value>;

const ITERATE: &str = "*";
const KEY: &str = "__key";
const VALUE: &str = "__value";

/// Merge `b` into `a`, failing if they disagree on a shared binding
pub fn merge(a: &Bindings, b: &Bindings) -> Option<Bindings> {
    let mut merged = a.clone();
    for (path, value) in b {
        match merged.get(path) {
            Some(existing) if existing != value => return None,
            Some(_) => {}
            None => {
                merged.insert(path.clone(), value.clone());
            }
        }
    }
    Some(merged)
}

/// Whether every binding in `part` also holds in `whole`
pub fn is_subset(part: &Bindings, whole: &Bindings) -> bool {
    part.iter().all(|(path, value)| whole.get(path) == Some(value))
}

struct Step {
    value: Value,
    bindings: Bindings,
    prefix: String,
}

fn extend(prefix: &str, component: &str) -> String {
    if prefix.is_empty() {
        component.to_string()
    } else {
        format!("{prefix}.{component}")
    }
}

/// Strings holding JSON text stand for the decoded value
///
/// Config-derived structs carry their attributes JSON-encoded, e.g.
/// `"{\"address\": \"10.1.1.1\"}"` or `"\"10.1.1.1\""`.
pub fn decoded(value: &Value) -> Cow<'_, Value> {
    if let Value::String(text) = value
        && let Ok(parsed) = serde_json::from_str::<Value>(text)
    {
        return Cow::Owned(parsed);
    }
    Cow::Borrowed(value)
}

/// Children of a container as `(key, child)`, honouring a binding at `prefix`
fn children(container: &Value, prefix: &str, bindings: &Bindings) -> Vec<(Value, Value)> {
    let all: Vec<(Value, Value)> = match container {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), decoded(v).into_owned()))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::from(i), decoded(v).into_owned()))
            .collect(),
        _ => Vec::new(),
    };

    match bindings.get(prefix) {
        Some(bound) => all.into_iter().filter(|(k, _)| k == bound).collect(),
        None => all,
    }
}

/// Resolve `path` against `root`
///
/// Returns every `(value, bindings)` pair the path produces. Missing literal
/// fields resolve to `null`. Iteration over an empty container produces no
/// pairs; iteration over `null` or a scalar produces a single `null`.
/// Iteration steps whose container path is already bound in `constraints`
/// only take the bound child. The returned bindings include the constraints.
pub fn resolve(root: &Value, path: &str, constraints: &Bindings) -> Vec<(Value, Bindings)> {
    let mut steps = vec![Step {
        value: root.clone(),
        bindings: constraints.clone(),
        prefix: String::new(),
    }];

    for component in path.split('.') {
        let mut next = Vec::new();

        for step in steps {
            match component {
                ITERATE | VALUE | KEY => {
                    let prefix = extend(&step.prefix, ITERATE);
                    if !(step.value.is_object() || step.value.is_array()) {
                        next.push(Step {
                            value: Value::Null,
                            bindings: step.bindings,
                            prefix,
                        });
                        continue;
                    }
                    for (child_key, child) in children(&step.value, &step.prefix, &step.bindings) {
                        let mut bindings = step.bindings.clone();
                        bindings.insert(step.prefix.clone(), child_key.clone());
                        let value = if component == KEY { child_key } else { child };
                        next.push(Step {
                            value,
                            bindings,
                            prefix: prefix.clone(),
                        });
                    }
                }
                literal if step.value.is_array() => {
                    let prefix = extend(&step.prefix, ITERATE);
                    for (index, item) in children(&step.value, &step.prefix, &step.bindings) {
                        let mut bindings = step.bindings.clone();
                        bindings.insert(step.prefix.clone(), index);
                        next.push(Step {
                            value: field(&item, literal),
                            bindings,
                            prefix: extend(&prefix, literal),
                        });
                    }
                }
                literal => next.push(Step {
                    value: field(&step.value, literal),
                    bindings: step.bindings,
                    prefix: extend(&step.prefix, literal),
                }),
            }
        }

        steps = next;
    }

    steps
        .into_iter()
        .map(|step| (step.value, step.bindings))
        .collect()
}

fn field(value: &Value, name: &str) -> Value {
    value
        .get(name)
        .map(|child| decoded(child).into_owned())
        .unwrap_or(Value::Null)
}
