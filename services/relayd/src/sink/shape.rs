//! Document shaping.
//!
//! A shape maps a row payload to the JSON document a sink stores or sends.
//! Shapes are looked up by the id named in the pipeline descriptor; the
//! built-in `identity` shape maps columns to fields one to one.

use relay_core::error::ValueError;
use relay_core::schema::ViewSchema;
use relay_core::value::Row;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names starting with this prefix are reserved and never shipped.
const RESERVED_PREFIX: char = '_';

#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("column {column:?}: {source}")]
    Value {
        column: String,
        source: ValueError,
    },
}

pub type ShapeFn = Arc<dyn Fn(&ViewSchema, &Row) -> Result<serde_json::Value, ShapeError> + Send + Sync>;

/// Identity shaping: one field per column, reserved columns dropped,
/// timestamps rendered as ISO-8601 UTC strings. A value with no JSON
/// representation fails loudly instead of being dropped.
pub fn identity_shape(schema: &ViewSchema, row: &Row) -> Result<serde_json::Value, ShapeError> {
    let mut map = serde_json::Map::with_capacity(schema.columns.len());
    for (column, value) in schema.columns.iter().zip(&row.0) {
        if column.name.starts_with(RESERVED_PREFIX) {
            continue;
        }
        let json = value.to_json().map_err(|source| ShapeError::Value {
            column: column.name.clone(),
            source,
        })?;
        map.insert(column.name.clone(), json);
    }
    Ok(serde_json::Value::Object(map))
}

/// Registry of shapes available to pipeline descriptors.
pub struct ShapeRegistry {
    shapes: HashMap<String, ShapeFn>,
}

impl ShapeRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = ShapeRegistry {
            shapes: HashMap::new(),
        };
        registry.register("identity", Arc::new(identity_shape));
        registry
    }

    /// Register or replace a shape under `id`.
    pub fn register(&mut self, id: impl Into<String>, shape: ShapeFn) {
        self.shapes.insert(id.into(), shape);
    }

    pub fn resolve(&self, id: &str) -> Option<ShapeFn> {
        self.shapes.get(id).cloned()
    }
}
