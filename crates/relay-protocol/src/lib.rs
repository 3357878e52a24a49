// relay-protocol: Broadcast WebSocket frame types and serialization.
//
// All frames are JSON objects with a top-level `kind` field for discriminated
// deserialization. The enum variants map 1:1 to the frame kinds exchanged on
// the /sync endpoint.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// One row inside a snapshot frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub key: String,
    pub row: serde_json::Value,
}

/// One upserted row inside a delta frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaUpsert {
    pub key: String,
    pub row: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Every frame exchanged on the sync socket, in both directions.
///
/// Client → server: `hello`, `pong`.
/// Server → client: `snapshot`, `snapshot_end`, `delta`, `ping`, `bye`.
///
/// Per subscribed view a client sees at most one snapshot (possibly chunked
/// into several `snapshot` frames closed by `snapshot_end`), then deltas with
/// strictly increasing `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncFrame {
    /// First client frame; subscribes to the listed views.
    Hello { views: Vec<String> },
    /// A chunk of the full view contents at subscription time.
    Snapshot { view: String, rows: Vec<SnapshotRow> },
    /// Marks the snapshot for `view` as complete.
    SnapshotEnd { view: String },
    /// The net effect of one upstream transaction on `view`.
    Delta {
        view: String,
        upserts: Vec<DeltaUpsert>,
        deletes: Vec<String>,
        ts: u64,
    },
    /// Liveness probe; the client must answer with `pong`.
    Ping,
    Pong,
    /// Controlled shutdown notice; the server closes right after.
    Bye { reason: String },
}

// ---------------------------------------------------------------------------
// Close codes and reasons
// ---------------------------------------------------------------------------

/// WebSocket close codes used by the broadcast endpoint.
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Application close reasons carried alongside the close code.
pub mod close_reasons {
    /// The client's outbound queue overflowed; reconnect to resume.
    pub const SLOW_CONSUMER: &str = "slow_consumer";
    /// The first frame was not a well-formed `hello`.
    pub const BAD_HELLO: &str = "bad_hello";
    /// The hello named a view this process does not serve.
    pub const UNKNOWN_VIEW: &str = "unknown_view";
    /// A mid-session frame could not be parsed.
    pub const BAD_FRAME: &str = "bad_frame";
}
