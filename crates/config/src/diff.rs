use std::collections::BTreeSet;

use serde_json::Value;

use crate::schema::ClawgateConfig;

/// Dotted paths whose value differs between two configs, sorted and unique.
pub type ChangedPaths = BTreeSet<String>;

/// Compare two configs by their serialized form.
///
/// Objects are walked key by key; arrays and scalars are compared whole, so
/// an edit inside `bindings` reports `bindings` rather than `bindings.3.agentId`.
pub fn diff(prev: &ClawgateConfig, next: &ClawgateConfig) -> ChangedPaths {
    let (Ok(a), Ok(b)) = (serde_json::to_value(prev), serde_json::to_value(next)) else {
        // Both sides serialize from the same plain-data schema; treat a
        // failure as "everything changed".
        return BTreeSet::from([String::new()]);
    };
    diff_values(&a, &b)
}

pub fn diff_values(prev: &Value, next: &Value) -> ChangedPaths {
    let mut out = BTreeSet::new();
    walk("", prev, next, &mut out);
    out
}

fn walk(prefix: &str, prev: &Value, next: &Value, out: &mut ChangedPaths) {
    match (prev, next) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let path = join(prefix, key);
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => walk(&path, x, y, out),
                    (Some(x), None) | (None, Some(x)) if x.is_null() => {},
                    _ => {
                        out.insert(path);
                    },
                }
            }
        },
        _ if prev != next => {
            out.insert(prefix.to_string());
        },
        _ => {},
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
