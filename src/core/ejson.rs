//! EJSON scalar wrappers and value normalization.
//!
//! The wire carries two non-JSON scalars as single-key objects:
//! `{"$date": epoch-ms}` for points in time and `{"$binary": base64}` for
//! byte strings. `EjsonDate` and `EjsonBinary` give typed documents fields
//! that serialize to exactly those shapes, so a codec round-trip preserves
//! them by construction.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const DATE_KEY: &str = "$date";
pub const BINARY_KEY: &str = "$binary";

/// Point in time as epoch milliseconds; wire shape `{"$date": ms}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EjsonDate(pub i64);

impl EjsonDate {
    pub fn now() -> Self {
        Self(now_ms())
    }

    pub fn epoch_ms(self) -> i64 {
        self.0
    }
}

impl Serialize for EjsonDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(DATE_KEY, &self.0)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for EjsonDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        date_ms(&value)
            .map(EjsonDate)
            .ok_or_else(|| D::Error::custom("expected {\"$date\": epoch-ms}"))
    }
}

/// Byte string; wire shape `{"$binary": base64}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EjsonBinary(pub Vec<u8>);

impl EjsonBinary {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for EjsonBinary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(BINARY_KEY, &BASE64.encode(&self.0))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for EjsonBinary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        binary_bytes(&value)
            .map(EjsonBinary)
            .ok_or_else(|| D::Error::custom("expected {\"$binary\": base64}"))
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Epoch milliseconds of a `{"$date": ms}` value. Accepts float payloads and
/// truncates them, matching what loose servers emit.
pub fn date_ms(value: &Value) -> Option<i64> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    number_ms(map.get(DATE_KEY)?)
}

/// Decoded bytes of a `{"$binary": base64}` value.
pub fn binary_bytes(value: &Value) -> Option<Vec<u8>> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let encoded = map.get(BINARY_KEY)?.as_str()?;
    BASE64.decode(encoded).ok()
}

fn number_ms(value: &Value) -> Option<i64> {
    if let Some(ms) = value.as_i64() {
        return Some(ms);
    }
    value.as_f64().map(|ms| ms as i64)
}

/// Recursive outgoing-value walk: canonicalize `$date` floats to integer
/// milliseconds. Arrays and nested objects recurse; everything else passes
/// through untouched.
pub fn normalize_value(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                normalize_value(item);
            }
        }
        Value::Object(map) => {
            if map.len() == 1
                && let Some(raw) = map.get(DATE_KEY)
                && !raw.is_i64()
                && let Some(ms) = number_ms(raw)
            {
                map.insert(DATE_KEY.to_string(), Value::from(ms));
                return;
            }
            for (_, field) in map.iter_mut() {
                normalize_value(field);
            }
        }
        _ => {}
    }
}

/// Serialize a typed value to its wire EJSON form.
pub fn to_ejson<T: Serialize>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value)
}

/// Parse a wire EJSON value into a typed value.
pub fn from_ejson<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn date_round_trips_through_wire_shape() {
        let date = EjsonDate(1_700_000_000_000);
        let wire = serde_json::to_value(date).unwrap();
        assert_eq!(wire, json!({"$date": 1_700_000_000_000_i64}));
        let back: EjsonDate = serde_json::from_value(wire).unwrap();
        assert_eq!(back, date);
    }

    #[test]
    fn date_accepts_float_milliseconds() {
        let back: EjsonDate = serde_json::from_value(json!({"$date": 1.7e12})).unwrap();
        assert_eq!(back.epoch_ms(), 1_700_000_000_000);
    }

    #[test]
    fn binary_round_trips_through_base64() {
        let binary = EjsonBinary(vec![0, 1, 2, 250]);
        let wire = serde_json::to_value(&binary).unwrap();
        assert_eq!(wire, json!({"$binary": "AAEC+g=="}));
        let back: EjsonBinary = serde_json::from_value(wire).unwrap();
        assert_eq!(back, binary);
    }

    #[test]
    fn rejects_multi_key_wrapper_objects() {
        assert_eq!(date_ms(&json!({"$date": 5, "extra": 1})), None);
        assert_eq!(binary_bytes(&json!({"$binary": "AA==", "x": 1})), None);
    }

    #[test]
    fn normalize_canonicalizes_nested_dates() {
        let mut value = json!({
            "when": {"$date": 2.5e3},
            "items": [{"stamp": {"$date": 100.9}}, 4],
            "note": "unchanged"
        });
        normalize_value(&mut value);
        assert_eq!(value["when"], json!({"$date": 2500}));
        assert_eq!(value["items"][0]["stamp"], json!({"$date": 100}));
        assert_eq!(value["note"], json!("unchanged"));
    }
}
