//! Scalar values and row payloads.
//!
//! Upstream rows arrive as ordered scalar tuples aligned with a per-view
//! [`ViewSchema`](crate::schema::ViewSchema). Hot paths index into the tuple;
//! column names are only consulted when converting to JSON for a sink.

use crate::error::ValueError;
use crate::schema::ViewSchema;
use chrono::{DateTime, SecondsFormat, Utc};

/// A single column value.
///
/// `Json` carries nested structured values (arrays, objects) that the view
/// exposes as a single column; `Null` is SQL NULL regardless of column kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Null,
}

impl Scalar {
    /// Convert to a JSON value for sink documents and broadcast frames.
    ///
    /// Timestamps become ISO-8601 UTC strings. Non-finite floats have no JSON
    /// representation and are rejected rather than silently dropped.
    pub fn to_json(&self) -> Result<serde_json::Value, ValueError> {
        match self {
            Scalar::String(s) => Ok(serde_json::Value::String(s.clone())),
            Scalar::Int(i) => Ok(serde_json::Value::from(*i)),
            Scalar::Float(f) => {
                if f.is_finite() {
                    Ok(serde_json::Value::from(*f))
                } else {
                    Err(ValueError::NonFiniteFloat(*f))
                }
            }
            Scalar::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Scalar::Timestamp(ts) => Ok(serde_json::Value::String(
                ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            Scalar::Json(v) => Ok(v.clone()),
            Scalar::Null => Ok(serde_json::Value::Null),
        }
    }

    /// Render this value as a row key, if the value is key-shaped.
    ///
    /// Keys must be non-empty; `Null` and nested values are never keys.
    pub fn as_key_string(&self) -> Option<String> {
        match self {
            Scalar::String(s) if !s.is_empty() => Some(s.clone()),
            Scalar::String(_) => None,
            Scalar::Int(i) => Some(i.to_string()),
            Scalar::Bool(b) => Some(b.to_string()),
            Scalar::Float(f) if f.is_finite() => Some(f.to_string()),
            Scalar::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            _ => None,
        }
    }
}

/// One row payload: column values in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(pub Vec<Scalar>);

impl Row {
    pub fn get(&self, index: usize) -> Option<&Scalar> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert to a JSON object keyed by column name.
    ///
    /// Columns beyond the schema length are ignored; missing trailing columns
    /// surface as absent fields rather than nulls.
    pub fn to_json_object(&self, schema: &ViewSchema) -> Result<serde_json::Value, ValueError> {
        let mut map = serde_json::Map::with_capacity(self.0.len());
        for (column, value) in schema.columns.iter().zip(self.0.iter()) {
            map.insert(column.name.clone(), value.to_json()?);
        }
        Ok(serde_json::Value::Object(map))
    }
}

impl From<Vec<Scalar>> for Row {
    fn from(values: Vec<Scalar>) -> Self {
        Row(values)
    }
}
