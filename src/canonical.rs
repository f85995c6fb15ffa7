//! Canonical JSON and content hashing.
//!
//! Canonical JSON sorts object keys lexicographically and uses compact
//! separators, so the same logical row always hashes to the same digest
//! regardless of how its `serde_json::Value` was built.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render `value` as canonical JSON (sorted keys, compact separators).
pub fn to_canonical_json(value: &Value) -> String {
    let sorted = sort_value(value);
    serde_json::to_string(&sorted).expect("Value -> String never fails")
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), sort_value(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

/// SHA-256 of the canonical JSON encoding of `value`, as lowercase hex.
pub fn hash_payload(value: &Value) -> String {
    let canonical = to_canonical_json(value);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// SHA-256 of an arbitrary byte string, as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(hash_payload(&a), hash_payload(&b));
    }

    #[test]
    fn nested_objects_are_sorted_recursively() {
        let value = json!({"z": {"y": 1, "x": 2}, "a": 1});
        assert_eq!(
            to_canonical_json(&value),
            r#"{"a":1,"z":{"x":2,"y":1}}"#
        );
    }

    #[test]
    fn different_payloads_hash_differently() {
        let a = json!({"name": "A"});
        let b = json!({"name": "B"});
        assert_ne!(hash_payload(&a), hash_payload(&b));
    }
}
