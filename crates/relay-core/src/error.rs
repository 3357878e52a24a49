//! Error taxonomy for the synchronization core.
//!
//! The split that matters operationally is transient vs fatal: transient
//! errors are absorbed by the per-pipeline supervisor (reconnect + backoff),
//! fatal errors halt that pipeline and surface through the health probes.

use thiserror::Error;

/// Errors from the upstream connection or its streams.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection could not be established or was lost mid-operation.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    /// The subscribed view does not exist on the upstream engine.
    #[error("view not found: {0}")]
    ViewNotFound(String),
    /// Credentials were rejected.
    #[error("upstream authentication failed: {0}")]
    Auth(String),
    /// The subscribe stream terminated. Expected only on connection loss.
    #[error("subscribe stream ended")]
    StreamEnded,
    /// A statement failed for a reason other than a missing view.
    #[error("upstream query failed: {0}")]
    Query(String),
    /// A row could not be parsed against the captured schema.
    #[error("malformed upstream row: {0}")]
    Malformed(String),
}

impl UpstreamError {
    /// Whether the supervisor should reconnect rather than halt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamError::Unavailable(_) | UpstreamError::StreamEnded | UpstreamError::Query(_)
        )
    }
}

/// Violations of the differential-stream contract. Always fatal for the
/// pipeline that observed them.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected diff {diff} for key {key:?}")]
    UnexpectedDiff { diff: i64, key: String },
    #[error("key column {column:?} missing from view {view:?}")]
    MissingKeyColumn { view: String, column: String },
    #[error("key column {column:?} is null or not stringifiable")]
    UnusableKey { column: String },
    #[error("change row carries no timestamp")]
    MissingTimestamp,
    #[error("timestamp {ts} at or below progress floor {floor}")]
    NonMonotonicTimestamp { ts: u64, floor: u64 },
    #[error("net diff for key {key:?} reached {net} within one progress window")]
    DiffOverflow { key: String, net: i64 },
    #[error("snapshot row arrived after the stream went live")]
    UnexpectedSnapshotRow,
}

/// A value that cannot be represented in a sink document.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("non-finite float {0} has no JSON representation")]
    NonFiniteFloat(f64),
}
