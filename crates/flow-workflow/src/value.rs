//! The dynamic value type flowing between nodes.
//!
//! The engine never forces a schema on node input/output: every node
//! produces a "mapping string -> value", where a value is the usual
//! JSON-shaped tagged union (null, bool, number, string, array, map).
//! `serde_json::Value` already models exactly that, so it is used directly
//! rather than hand-rolling an equivalent enum.

use serde_json::Value as Json;

/// A node's input or output payload.
pub type NodeMap = serde_json::Map<String, Json>;

/// Re-exported so callers don't need a direct `serde_json` dependency just
/// to name the value type.
pub type Value = Json;

/// Navigate a dotted path (`a.b.c`) through a `Value`, treating array indices
/// as decimal segments (`items.0.name`). A missing segment resolves to
/// `Value::Null` rather than erroring - expression-level missing data is
/// never an error (spec §4.1, §7).
pub fn get_path(root: &Value, path: &str) -> Value {
    if path.is_empty() {
        return root.clone();
    }
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        match current {
            Json::Object(map) => match map.get(segment) {
                Some(v) => current = v,
                None => return Json::Null,
            },
            Json::Array(arr) => match segment.parse::<usize>().ok().and_then(|i| arr.get(i)) {
                Some(v) => current = v,
                None => return Json::Null,
            },
            _ => return Json::Null,
        }
    }
    current.clone()
}

/// Stringify a value using the engine's canonical textual form: integers
/// print without a trailing `.0`, booleans lowercase, strings raw (no
/// quoting), null as the literal `null`. Used when a template embeds a
/// non-string value inside a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Json::Null => "null".to_string(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            } else {
                n.to_string()
            }
        }
        Json::String(s) => s.clone(),
        Json::Array(_) | Json::Object(_) => {
            serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
        }
    }
}

/// Shallow-overlay `b` onto `a`: keys in `b` win, everything else from `a` is
/// preserved. This is the scheduler's input-composition merge policy (spec
/// §4.5) and the `passThrough`/exclusive merge payload policy (spec §4.3).
pub fn shallow_overlay(a: &NodeMap, b: &NodeMap) -> NodeMap {
    let mut out = a.clone();
    for (k, v) in b {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// Recursively overlay `b` onto `a`: at a leaf (non-object) conflict, `b`
/// wins; object values are merged key by key. Used by merge mode `merge`.
pub fn deep_overlay(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Json::Object(am), Json::Object(bm)) => {
            let mut out = am.clone();
            for (k, bv) in bm {
                let merged = match am.get(k) {
                    Some(av) => deep_overlay(av, bv),
                    None => bv.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Json::Object(out)
        }
        (_, b) => b.clone(),
    }
}

/// `true`/`false`-ness of a `Value` for boolean contexts (conditions without
/// an explicit comparison, e.g. `{{ $vars.enabled }}`).
pub fn truthy(value: &Value) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

/// Reserved output key prefix. User executors must never write a key
/// starting with this (spec §6, testable property 6).
pub const RESERVED_PREFIX: char = '_';

pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// Drop every reserved (`_`-prefixed) key. Applied by the scheduler when an
/// upstream output is consumed as another node's input or as a `merge`
/// branch payload - markers are scheduler bookkeeping, not data (spec §4.5
/// step 5).
pub fn strip_reserved(map: &NodeMap) -> NodeMap {
    map.iter()
        .filter(|(k, _)| !is_reserved_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_navigation_missing_is_null() {
        let root = json!({"a": {"b": 1}});
        assert_eq!(get_path(&root, "a.b"), json!(1));
        assert_eq!(get_path(&root, "a.c"), Json::Null);
        assert_eq!(get_path(&root, "x.y.z"), Json::Null);
    }

    #[test]
    fn path_navigation_array_index() {
        let root = json!({"items": [10, 20, 30]});
        assert_eq!(get_path(&root, "items.1"), json!(20));
        assert_eq!(get_path(&root, "items.9"), Json::Null);
    }

    #[test]
    fn stringify_integers_have_no_trailing_zero() {
        assert_eq!(stringify(&json!(3.0)), "3");
        assert_eq!(stringify(&json!(3.5)), "3.5");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&Json::Null), "null");
    }

    #[test]
    fn deep_overlay_merges_nested_objects() {
        let a = json!({"x": {"a": 1, "b": 2}, "y": 1});
        let b = json!({"x": {"b": 3, "c": 4}});
        let merged = deep_overlay(&a, &b);
        assert_eq!(merged, json!({"x": {"a": 1, "b": 3, "c": 4}, "y": 1}));
    }
}
