//! Stream events and consolidated batches.

use crate::value::{Row, Scalar};

/// One row as produced by the upstream connector, before classification.
///
/// - Progress marks: `progressed = true`, `ts` set, `diff` absent.
/// - Snapshot rows: `diff` absent, `progressed = false`.
/// - Changes: `ts` and `diff` set.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub ts: Option<u64>,
    pub diff: Option<i64>,
    pub progressed: bool,
    pub values: Vec<Scalar>,
}

impl RawRow {
    pub fn progress(ts: u64) -> Self {
        RawRow {
            ts: Some(ts),
            diff: None,
            progressed: true,
            values: Vec::new(),
        }
    }

    pub fn snapshot(values: Vec<Scalar>) -> Self {
        RawRow {
            ts: None,
            diff: None,
            progressed: false,
            values,
        }
    }

    pub fn change(ts: u64, diff: i64, values: Vec<Scalar>) -> Self {
        RawRow {
            ts: Some(ts),
            diff: Some(diff),
            progressed: false,
            values,
        }
    }
}

/// A classified stream event, keyed and ready for consolidation.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Snapshot { key: String, row: Row },
    Progress { ts: u64 },
    Change { ts: u64, diff: i8, key: String, row: Row },
}

/// One consolidated per-key operation.
#[derive(Debug, Clone, PartialEq)]
pub enum NetOp {
    Upsert { key: String, row: Row },
    Delete { key: String },
}

impl NetOp {
    pub fn key(&self) -> &str {
        match self {
            NetOp::Upsert { key, .. } | NetOp::Delete { key } => key,
        }
    }
}

/// The consolidator's output for one progress window: at most one net
/// operation per key, in first-touch order. `ts` is the progress mark that
/// closed the window; batches are emitted with strictly increasing `ts`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushBatch {
    pub ts: u64,
    pub ops: Vec<NetOp>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}
