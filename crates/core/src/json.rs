//! JSON helpers shared across crates.
//!
//! Payloads, telemetry and journal records are all plain JSON objects. The
//! knowledge base fingerprints suggestions by their canonical form, so key
//! order must never leak into comparisons.

use serde_json::{Map, Value};

/// A JSON object, the payload currency of every stagehand crate.
pub type JsonMap = Map<String, Value>;

/// Return a copy of `value` with every object's keys sorted, recursively.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize `value` compactly with sorted keys.
#[must_use]
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Borrow a non-empty string field from a JSON object.
#[must_use]
pub fn str_field<'a>(map: &'a JsonMap, key: &str) -> Option<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Build a JSON object from `(key, value)` pairs.
pub fn object<K, I>(pairs: I) -> JsonMap
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
