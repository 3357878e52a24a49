//! Change-stream decoding.
//!
//! Classifies raw rows into snapshot / progress / change events and extracts
//! the row key. Pure per-row work; the key column is resolved to an index
//! once at construction.

use crate::error::ProtocolError;
use crate::event::{RawRow, ViewEvent};
use crate::schema::ViewSchema;
use crate::value::Row;
use std::sync::Arc;

#[derive(Debug)]
pub struct Decoder {
    schema: Arc<ViewSchema>,
    key_column: String,
    key_index: usize,
}

impl Decoder {
    /// Fails with `MissingKeyColumn` if the schema has no such column.
    pub fn new(schema: Arc<ViewSchema>, key_column: &str) -> Result<Self, ProtocolError> {
        let key_index =
            schema
                .column_index(key_column)
                .ok_or_else(|| ProtocolError::MissingKeyColumn {
                    view: schema.view.clone(),
                    column: key_column.to_owned(),
                })?;
        Ok(Decoder {
            schema,
            key_column: key_column.to_owned(),
            key_index,
        })
    }

    pub fn schema(&self) -> &Arc<ViewSchema> {
        &self.schema
    }

    pub fn decode(&self, raw: RawRow) -> Result<ViewEvent, ProtocolError> {
        if raw.progressed {
            let ts = raw.ts.ok_or(ProtocolError::MissingTimestamp)?;
            return Ok(ViewEvent::Progress { ts });
        }
        let row = Row(raw.values);
        match raw.diff {
            None => {
                let key = self.key_of(&row)?;
                Ok(ViewEvent::Snapshot { key, row })
            }
            Some(diff @ (1 | -1)) => {
                let ts = raw.ts.ok_or(ProtocolError::MissingTimestamp)?;
                let key = self.key_of(&row)?;
                Ok(ViewEvent::Change {
                    ts,
                    diff: diff as i8,
                    key,
                    row,
                })
            }
            Some(diff) => Err(ProtocolError::UnexpectedDiff {
                diff,
                key: self.key_of(&row).unwrap_or_default(),
            }),
        }
    }

    fn key_of(&self, row: &Row) -> Result<String, ProtocolError> {
        row.get(self.key_index)
            .and_then(|value| value.as_key_string())
            .ok_or_else(|| ProtocolError::UnusableKey {
                column: self.key_column.clone(),
            })
    }
}
