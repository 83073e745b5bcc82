//! Raw attribution values and their reduction to transport-safe JSON.
//!
//! Attribution sources hand over loosely typed payloads: optional wrappers,
//! timestamps, nested containers and the occasional value that has no JSON
//! form at all. `RawValue` models all of them explicitly and `sanitize`
//! reduces a value to something `serde_json` can always serialize.

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Number, Value};

/// A payload as published by one attribution source.
pub type Payload = IndexMap<String, RawValue>;

#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    String(String),
    /// A JSON number. Always finite.
    Number(Number),
    /// A float straight from a source, which may be NaN or infinite.
    Float(f64),
    Bool(bool),
    Null,
    /// An optional wrapper. `None` means "no value" and is dropped, unlike `Null`.
    Optional(Option<Box<RawValue>>),
    Date(DateTime<Utc>),
    List(Vec<RawValue>),
    Map(IndexMap<String, RawValue>),
    /// Anything a source sent that has no JSON representation, named by its type.
    Opaque(String),
}

impl RawValue {
    pub fn none() -> Self {
        RawValue::Optional(None)
    }

    pub fn some(value: impl Into<RawValue>) -> Self {
        RawValue::Optional(Some(Box::new(value.into())))
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(b),
            Value::Number(n) => RawValue::Number(n),
            Value::String(s) => RawValue::String(s),
            Value::Array(items) => RawValue::List(items.into_iter().map(RawValue::from).collect()),
            Value::Object(entries) => RawValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, RawValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::String(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::String(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Number(value.into())
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Float(value)
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(value: DateTime<Utc>) -> Self {
        RawValue::Date(value)
    }
}

/// Converts a JSON object into a payload. Non-object values yield an empty payload.
pub fn payload_from_json(value: Value) -> Payload {
    match value {
        Value::Object(entries) => entries
            .into_iter()
            .map(|(k, v)| (k, RawValue::from(v)))
            .collect(),
        other => {
            tracing::debug!(kind = json_kind(&other), "Ignoring non-object attribution payload");
            Payload::new()
        }
    }
}

/// Reduces a raw value to its transport-safe form, or `None` when nothing of
/// it can be sent. Pure and deterministic.
pub fn sanitize(value: &RawValue) -> Option<Value> {
    match value {
        RawValue::Optional(inner) => inner.as_deref().and_then(sanitize),
        RawValue::String(s) => Some(Value::String(s.clone())),
        RawValue::Number(n) => Some(Value::Number(n.clone())),
        RawValue::Float(f) => Number::from_f64(*f).map(Value::Number),
        RawValue::Bool(b) => Some(Value::Bool(*b)),
        RawValue::Null => Some(Value::Null),
        RawValue::Date(date) => Some(Value::String(format_date(date))),
        RawValue::List(items) => Some(Value::Array(items.iter().filter_map(sanitize).collect())),
        RawValue::Map(entries) => Some(Value::Object(sanitize_map(entries))),
        RawValue::Opaque(type_name) => {
            tracing::trace!(type_name = %type_name, "Dropping unrepresentable attribution value");
            None
        }
    }
}

/// Sanitizes every entry of a map, dropping the ones that sanitize to nothing.
pub fn sanitize_map(entries: &IndexMap<String, RawValue>) -> Map<String, Value> {
    entries
        .iter()
        .filter_map(|(key, value)| sanitize(value).map(|v| (key.clone(), v)))
        .collect()
}

/// ISO-8601 in UTC with whole seconds, e.g. `2025-11-22T09:30:00Z`.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample() -> RawValue {
        let installed = Utc.with_ymd_and_hms(2025, 11, 22, 9, 30, 15).unwrap();
        RawValue::Map(IndexMap::from([
            ("campaign".to_string(), RawValue::some("spring")),
            ("missing".to_string(), RawValue::none()),
            ("nested_optional".to_string(), RawValue::some(RawValue::some(7_i64))),
            ("is_first_launch".to_string(), RawValue::Bool(true)),
            ("cost".to_string(), RawValue::Float(0.25)),
            ("bad_cost".to_string(), RawValue::Float(f64::NAN)),
            ("install_time".to_string(), RawValue::Date(installed)),
            ("referrer".to_string(), RawValue::Null),
            (
                "clicks".to_string(),
                RawValue::List(vec![
                    RawValue::from(1_i64),
                    RawValue::none(),
                    RawValue::Opaque("UIImage".into()),
                    RawValue::from("two"),
                ]),
            ),
            ("handle".to_string(), RawValue::Opaque("NSObject".into())),
        ]))
    }

    #[test]
    fn test_sanitize_strips_and_unwraps() {
        let sanitized = sanitize(&sample()).unwrap();

        assert_eq!(
            sanitized,
            json!({
                "campaign": "spring",
                "nested_optional": 7,
                "is_first_launch": true,
                "cost": 0.25,
                "install_time": "2025-11-22T09:30:15Z",
                "referrer": null,
                "clicks": [1, "two"],
            })
        );
    }

    #[test]
    fn test_sanitize_top_level_absent() {
        assert_eq!(sanitize(&RawValue::none()), None);
        assert_eq!(sanitize(&RawValue::Opaque("Data".into())), None);
        assert_eq!(sanitize(&RawValue::Float(f64::INFINITY)), None);
        // Null is a value, not an absence
        assert_eq!(sanitize(&RawValue::some(RawValue::Null)), Some(Value::Null));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = vec![
            sample(),
            RawValue::from(json!({"a": [1, 2.5, {"b": null}], "c": "d"})),
            RawValue::List(vec![RawValue::none(), RawValue::Float(-0.0)]),
            RawValue::from(u64::MAX as i64),
        ];

        for input in inputs {
            let once = sanitize(&input);
            let twice = once.clone().map(RawValue::from).and_then(|v| sanitize(&v));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_sanitize_is_deterministic() {
        assert_eq!(sanitize(&sample()), sanitize(&sample()));
    }

    #[test]
    fn test_payload_from_json() {
        let payload = payload_from_json(json!({"media_source": "organic", "af_sub1": 3}));
        assert_eq!(payload.len(), 2);
        assert_eq!(payload["media_source"], RawValue::from("organic"));

        assert!(payload_from_json(json!(["not", "an", "object"])).is_empty());
    }
}
