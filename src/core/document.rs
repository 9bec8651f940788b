//! EJSON documents addressed by `_id`.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::ejson;

pub const ID_FIELD: &str = "_id";
/// Stamped by the offline overlay at persist time when absent.
pub const LAST_UPDATED_FIELD: &str = "_lastUpdated_";
/// Set on cache restore; cleared when the server first delivers a
/// replacement for the same `_id`.
pub const WAS_OFFLINE_FIELD: &str = "_wasOffline_";

#[derive(Debug, Error, PartialEq)]
pub enum DocumentError {
    #[error("document is not a JSON object")]
    NotAnObject,
    #[error("document is missing a string `_id`")]
    MissingId,
}

/// An unordered field map with a mandatory string `_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(ID_FIELD.to_string(), Value::String(id.into()));
        Self { fields }
    }

    /// Validate an arbitrary JSON value as a document.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let Value::Object(fields) = value else {
            return Err(DocumentError::NotAnObject);
        };
        if !fields.get(ID_FIELD).is_some_and(Value::is_string) {
            return Err(DocumentError::MissingId);
        }
        Ok(Self { fields })
    }

    /// Build `{_id, ...fields}` from a change-stream frame. A stray `_id`
    /// inside `fields` is overridden by the frame-level id.
    pub fn from_frame_fields(id: &str, fields: Map<String, Value>) -> Self {
        let mut doc = Self { fields };
        doc.fields
            .insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        doc
    }

    pub fn id(&self) -> &str {
        self.fields
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .expect("document always carries a string _id")
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Apply a `changed` frame: set `fields`, delete `cleared`. The `_id`
    /// cannot be changed or cleared.
    pub fn apply_change(&mut self, fields: &Map<String, Value>, cleared: &[String]) {
        for (name, value) in fields {
            if name == ID_FIELD {
                continue;
            }
            self.fields.insert(name.clone(), value.clone());
        }
        for name in cleared {
            if name == ID_FIELD {
                continue;
            }
            self.fields.remove(name);
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn was_offline(&self) -> bool {
        self.fields
            .get(WAS_OFFLINE_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn flag_was_offline(&mut self) {
        self.fields
            .insert(WAS_OFFLINE_FIELD.to_string(), Value::Bool(true));
    }

    pub fn has_last_updated(&self) -> bool {
        self.fields.contains_key(LAST_UPDATED_FIELD)
    }

    /// Stamp `_lastUpdated_` when absent; existing stamps are left alone.
    pub fn stamp_last_updated(&mut self, epoch_ms: i64) {
        if !self.has_last_updated() {
            let stamp = serde_json::json!({ ejson::DATE_KEY: epoch_ms });
            self.fields.insert(LAST_UPDATED_FIELD.to_string(), stamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_requires_object_with_string_id() {
        assert_eq!(
            Document::from_value(json!(["a"])).unwrap_err(),
            DocumentError::NotAnObject
        );
        assert_eq!(
            Document::from_value(json!({"name": "x"})).unwrap_err(),
            DocumentError::MissingId
        );
        assert_eq!(
            Document::from_value(json!({"_id": 7})).unwrap_err(),
            DocumentError::MissingId
        );
        let doc = Document::from_value(json!({"_id": "a", "n": 1})).unwrap();
        assert_eq!(doc.id(), "a");
    }

    #[test]
    fn frame_fields_id_wins_over_embedded_id() {
        let mut fields = Map::new();
        fields.insert("_id".to_string(), json!("sneaky"));
        fields.insert("n".to_string(), json!(2));
        let doc = Document::from_frame_fields("real", fields);
        assert_eq!(doc.id(), "real");
        assert_eq!(doc.get("n"), Some(&json!(2)));
    }

    #[test]
    fn apply_change_sets_and_clears() {
        let mut doc = Document::from_value(json!({"_id": "a", "keep": 1, "drop": 2})).unwrap();
        let mut fields = Map::new();
        fields.insert("fresh".to_string(), json!(3));
        fields.insert("_id".to_string(), json!("nope"));
        doc.apply_change(&fields, &["drop".to_string(), "_id".to_string()]);
        assert_eq!(doc.id(), "a");
        assert_eq!(doc.get("keep"), Some(&json!(1)));
        assert_eq!(doc.get("fresh"), Some(&json!(3)));
        assert_eq!(doc.get("drop"), None);
    }

    #[test]
    fn last_updated_stamp_is_idempotent() {
        let mut doc = Document::new("a");
        assert!(!doc.has_last_updated());
        doc.stamp_last_updated(1000);
        doc.stamp_last_updated(2000);
        assert_eq!(doc.get(LAST_UPDATED_FIELD), Some(&json!({"$date": 1000})));
    }

    #[test]
    fn offline_flag_lifecycle() {
        let mut doc = Document::new("a");
        assert!(!doc.was_offline());
        doc.flag_was_offline();
        assert!(doc.was_offline());
    }
}
