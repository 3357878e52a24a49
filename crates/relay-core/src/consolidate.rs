//! Batch consolidation.
//!
//! Changes are buffered per key until a progress mark, then folded into at
//! most one net operation per key:
//!
//! - net diff +1 → upsert with the latest payload
//! - net diff −1 → delete
//! - net diff 0 with a changed payload (delete-then-insert update) → upsert
//! - net diff 0 with an identical payload → omitted
//!
//! A progress mark at `ts` commits every change with timestamp ≤ `ts`; any
//! later change at or below that mark violates the stream contract.

use crate::error::ProtocolError;
use crate::event::{FlushBatch, NetOp, ViewEvent};
use crate::value::Row;
use std::collections::HashMap;
use tracing::warn;

pub const DEFAULT_MAX_PENDING_KEYS: usize = 100_000;

struct Pending {
    net: i64,
    first_row: Row,
    latest_row: Row,
    latest_ts: u64,
}

pub struct Consolidator {
    pending: HashMap<String, Pending>,
    /// Keys in first-touch order, so emitted batches are deterministic.
    order: Vec<String>,
    /// Highest progress mark emitted so far; changes must land above it.
    floor: Option<u64>,
    max_pending_keys: usize,
    saturation_logged: bool,
}

impl Consolidator {
    pub fn new(max_pending_keys: usize) -> Self {
        Consolidator {
            pending: HashMap::new(),
            order: Vec::new(),
            floor: None,
            max_pending_keys,
            saturation_logged: false,
        }
    }

    /// Feed one decoded event. Returns a batch when `event` is a progress
    /// mark that closes a non-empty window.
    pub fn push(&mut self, event: ViewEvent) -> Result<Option<FlushBatch>, ProtocolError> {
        match event {
            ViewEvent::Change { ts, diff, key, row } => {
                self.push_change(ts, diff, key, row)?;
                Ok(None)
            }
            ViewEvent::Progress { ts } => self.push_progress(ts),
            ViewEvent::Snapshot { .. } => Err(ProtocolError::UnexpectedSnapshotRow),
        }
    }

    /// Number of keys buffered in the current progress window.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the pending buffer has crossed its configured bound.
    ///
    /// While saturated the caller must pause upstream consumption: stop
    /// reading ahead and hold off further socket reads until the next
    /// progress mark drains the buffer. The draining mark arrives in-band,
    /// so reads are throttled rather than stopped outright.
    pub fn is_saturated(&self) -> bool {
        self.pending.len() > self.max_pending_keys
    }

    /// Drop uncommitted state. Called when the stream terminates: the window
    /// was never acknowledged by a progress mark, so replay after reconnect
    /// will deliver it again.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.order.clear();
        self.saturation_logged = false;
        dropped
    }

    fn push_change(
        &mut self,
        ts: u64,
        diff: i8,
        key: String,
        row: Row,
    ) -> Result<(), ProtocolError> {
        if let Some(floor) = self.floor {
            if ts <= floor {
                return Err(ProtocolError::NonMonotonicTimestamp { ts, floor });
            }
        }
        match self.pending.get_mut(&key) {
            Some(entry) => {
                entry.net += i64::from(diff);
                if entry.net.abs() > 1 {
                    return Err(ProtocolError::DiffOverflow {
                        key,
                        net: entry.net,
                    });
                }
                if ts >= entry.latest_ts {
                    entry.latest_ts = ts;
                    entry.latest_row = row;
                }
            }
            None => {
                self.pending.insert(
                    key.clone(),
                    Pending {
                        net: i64::from(diff),
                        first_row: row.clone(),
                        latest_row: row,
                        latest_ts: ts,
                    },
                );
                self.order.push(key);
                if self.is_saturated() && !self.saturation_logged {
                    self.saturation_logged = true;
                    warn!(
                        pending = self.pending.len(),
                        bound = self.max_pending_keys,
                        "pending buffer saturated; pausing upstream reads until the next progress mark"
                    );
                }
            }
        }
        Ok(())
    }

    fn push_progress(&mut self, ts: u64) -> Result<Option<FlushBatch>, ProtocolError> {
        if let Some(floor) = self.floor {
            if ts < floor {
                return Err(ProtocolError::NonMonotonicTimestamp { ts, floor });
            }
        }
        if self.pending.is_empty() {
            self.floor = Some(ts);
            return Ok(None);
        }
        // Everything buffered must be committed by this mark.
        for (key, entry) in &self.pending {
            if entry.latest_ts > ts {
                return Err(ProtocolError::NonMonotonicTimestamp {
                    ts: entry.latest_ts,
                    floor: ts,
                });
            }
            debug_assert!(entry.net.abs() <= 1, "unchecked net diff for {key}");
        }
        let mut ops = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            let entry = match self.pending.remove(&key) {
                Some(entry) => entry,
                None => continue,
            };
            match entry.net {
                1 => ops.push(NetOp::Upsert {
                    key,
                    row: entry.latest_row,
                }),
                -1 => ops.push(NetOp::Delete { key }),
                0 => {
                    if entry.latest_row != entry.first_row {
                        ops.push(NetOp::Upsert {
                            key,
                            row: entry.latest_row,
                        });
                    }
                }
                _ => unreachable!("net diff bounded at accumulation"),
            }
        }
        self.pending.clear();
        self.saturation_logged = false;
        self.floor = Some(ts);
        if ops.is_empty() {
            Ok(None)
        } else {
            Ok(Some(FlushBatch { ts, ops }))
        }
    }
}
