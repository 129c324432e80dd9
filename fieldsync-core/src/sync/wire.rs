//! Self-describing batch wire format.
//!
//! A batch is an ordered JSON array of records, each tagged with its
//! concrete type name and carrying the full field set, sync metadata
//! included. Output is indented with stable field ordering so batch
//! diffs stay inspectable.

use crate::sync::canonical::FieldValue;
use crate::sync::record::SyncMeta;
use crate::{DatabaseError, FieldSyncError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One record on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub fields: BTreeMap<String, Value>,
}

impl WireRecord {
    /// Build a wire record from sync metadata and payload fields.
    pub fn from_parts(
        record_type: &str,
        meta: &SyncMeta,
        payload: &[(&'static str, FieldValue)],
    ) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            "id".to_string(),
            meta.id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        fields.insert(
            "counter".to_string(),
            meta.counter.map(Value::from).unwrap_or(Value::Null),
        );
        fields.insert(
            "signature".to_string(),
            Value::String(meta.signature.clone()),
        );
        fields.insert(
            "signed_by".to_string(),
            meta.signed_by
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        fields.insert(
            "signed_version".to_string(),
            Value::from(i64::from(meta.signed_version)),
        );
        for (name, value) in payload {
            fields.insert((*name).to_string(), value_to_json(value));
        }
        Self {
            record_type: record_type.to_string(),
            fields,
        }
    }

    /// Extract the sync metadata fields.
    pub fn meta(&self) -> Result<SyncMeta> {
        Ok(SyncMeta {
            id: Some(self.text("id")?),
            counter: Some(self.integer("counter")?),
            signature: self.optional_text("signature")?.unwrap_or_default(),
            signed_by: self.optional_text("signed_by")?,
            signed_version: self.integer("signed_version")? as i32,
        })
    }

    fn get(&self, name: &str) -> Result<&Value> {
        self.fields.get(name).ok_or_else(|| {
            FieldSyncError::Wire(format!(
                "{} record is missing field '{}'",
                self.record_type, name
            ))
        })
    }

    /// A required text field.
    pub fn text(&self, name: &str) -> Result<String> {
        match self.get(name)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(FieldSyncError::Wire(format!(
                "{} field '{}' should be text, got {}",
                self.record_type, name, other
            ))),
        }
    }

    /// A text field that may be null or absent.
    pub fn optional_text(&self, name: &str) -> Result<Option<String>> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(FieldSyncError::Wire(format!(
                "{} field '{}' should be text, got {}",
                self.record_type, name, other
            ))),
        }
    }

    /// A required integer field.
    pub fn integer(&self, name: &str) -> Result<i64> {
        self.get(name)?.as_i64().ok_or_else(|| {
            FieldSyncError::Wire(format!(
                "{} field '{}' should be an integer",
                self.record_type, name
            ))
        })
    }

    /// A float field that may be null or absent.
    pub fn optional_float(&self, name: &str) -> Result<Option<f64>> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| {
                FieldSyncError::Wire(format!(
                    "{} field '{}' should be a number",
                    self.record_type, name
                ))
            }),
        }
    }

    /// A required boolean field.
    pub fn boolean(&self, name: &str) -> Result<bool> {
        self.get(name)?.as_bool().ok_or_else(|| {
            FieldSyncError::Wire(format!(
                "{} field '{}' should be a boolean",
                self.record_type, name
            ))
        })
    }
}

/// Serialize a batch of wire records as indented JSON.
pub fn serialize_batch(records: &[WireRecord]) -> Result<String> {
    serde_json::to_string_pretty(records)
        .map_err(|e| DatabaseError::Serialization(e.to_string()).into())
}

/// Parse a batch. A payload that is not a well-formed batch is a
/// caller error, not a per-record rejection.
pub fn parse_batch(data: &str) -> Result<Vec<WireRecord>> {
    serde_json::from_str(data).map_err(|e| FieldSyncError::Wire(e.to_string()))
}

fn value_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Text(s) | FieldValue::Reference(s) => Value::String(s.clone()),
        FieldValue::Integer(i) => Value::from(*i),
        FieldValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::Null => Value::Null,
    }
}
