//! Per-view column schemas.
//!
//! A schema is captured once per subscription (from the upstream statement
//! description) and shared read-only across the pipeline stages.

/// The parse/convert kind of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Column {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered column list for one view. Column order is fixed for the lifetime
/// of a subscription; payload rows are positionally aligned with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSchema {
    pub view: String,
    pub columns: Vec<Column>,
}

impl ViewSchema {
    pub fn new(view: impl Into<String>, columns: Vec<Column>) -> Self {
        ViewSchema {
            view: view.into(),
            columns,
        }
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}
