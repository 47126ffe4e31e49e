use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Point-in-time view of an animal's clinical data
///
/// Wraps a JSON object. Condition fields are resolved against it by
/// dotted path, so nested exam records can be read without flattening.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClinicalSnapshot {
    /// Field values, keyed by name or nested object
    pub fields: Map<String, Value>,

    /// When the provider captured this view
    pub captured_at: DateTime<Utc>,
}

impl ClinicalSnapshot {
    /// Create a snapshot from a field map
    pub fn new(fields: Map<String, Value>, captured_at: DateTime<Utc>) -> Self {
        Self {
            fields,
            captured_at,
        }
    }

    /// Create an empty snapshot
    pub fn empty(captured_at: DateTime<Utc>) -> Self {
        Self {
            fields: Map::new(),
            captured_at,
        }
    }

    /// Build a snapshot from any JSON value; non-objects yield an empty snapshot
    pub fn from_value(value: Value, captured_at: DateTime<Utc>) -> Self {
        match value {
            Value::Object(fields) => Self::new(fields, captured_at),
            _ => Self::empty(captured_at),
        }
    }

    /// Set a top-level field
    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Resolve a field by plain name or dotted path
    ///
    /// Returns `None` for missing fields and explicit nulls.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.fields.get(path) {
            return (!value.is_null()).then(|| value.clone());
        }

        if !path.contains('.') {
            return None;
        }

        let compiled = match jmespath::compile(path) {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "Unresolvable snapshot path");
                return None;
            }
        };

        let root = Value::Object(self.fields.clone());
        match compiled.search(&root) {
            Ok(found) => match serde_json::to_value(&*found) {
                Ok(Value::Null) | Err(_) => None,
                Ok(value) => Some(value),
            },
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "Snapshot path search failed");
                None
            }
        }
    }

    /// Whether the snapshot was captured at or after `instant`
    pub fn is_fresh_since(&self, instant: DateTime<Utc>) -> bool {
        self.captured_at >= instant
    }
}
