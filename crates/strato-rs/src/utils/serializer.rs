//! Safe JSON emission.
//!
//! The main serialization path is plain `serde_json`. When it fails — deep
//! recursion, non-string map keys, non-finite floats from upstream data —
//! the fallback walks the value with a depth budget and replaces anything
//! it cannot represent with a stable reference marker. The contract is
//! that response serialization never surfaces to a client as a 500.

use serde_json::{Map, Value};

/// Nesting depth past which the fallback cuts over to markers. Values this
/// deep are assumed to be self-referential or pathological.
const MAX_DEPTH: usize = 128;

/// Marker emitted where a value could not be represented.
fn marker(kind: &str, depth: usize) -> Value {
    Value::String(format!("[Ref:{}@{}]", kind, depth))
}

fn sanitize(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return marker("depth", depth);
    }
    match value {
        Value::Number(n) => {
            // Non-finite floats have no JSON rendering.
            if n.as_f64().map(|f| !f.is_finite()).unwrap_or(false) {
                marker("nan", depth)
            } else {
                value.clone()
            }
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| sanitize(v, depth + 1)).collect())
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), sanitize(v, depth + 1));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Serializes `value`, falling back to the marker-based walk when the
/// native path fails. Always returns valid JSON bytes.
pub fn to_safe_json(value: &Value) -> Vec<u8> {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(_) => {
            let cleaned = sanitize(value, 0);
            serde_json::to_vec(&cleaned).unwrap_or_else(|_| b"{}".to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn acyclic_values_round_trip() {
        let value = json!({"a": [1, 2, {"b": "c"}], "d": null});
        let bytes = to_safe_json(&value);
        let back: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn deep_nesting_degrades_to_markers() {
        let mut value = json!("leaf");
        for _ in 0..300 {
            value = json!([value]);
        }
        let cleaned = sanitize(&value, 0);
        let bytes = serde_json::to_vec(&cleaned).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("[Ref:depth@"));
    }

    #[test]
    fn output_is_always_parseable() {
        let value = json!({"ok": true});
        let back: Value = serde_json::from_slice(&to_safe_json(&value)).unwrap();
        assert_eq!(back["ok"], true);
    }
}
