//! Upstream connector contract.
//!
//! Pipelines are generic over this trait so they can run against the real
//! wire-protocol connector or a scripted one in tests. A connector value is a
//! cheap handle; each `snapshot`/`subscribe` call opens its own logical
//! connection, and dropping the returned stream releases it.

use crate::error::UpstreamError;
use crate::event::RawRow;
use crate::schema::ViewSchema;
use crate::value::Row;
use futures::Stream;
use std::future::Future;
use std::sync::Arc;

/// Options for a subscribe call.
///
/// `with_progress` must stay enabled for consolidation to flush; it exists so
/// the raw stream can be inspected without progress marks in tooling.
/// `emit_snapshot` asks the engine to front-load the current view contents as
/// snapshot rows before the first progress mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub with_progress: bool,
    pub emit_snapshot: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            with_progress: true,
            emit_snapshot: true,
        }
    }
}

/// A source of view snapshots and differential change streams.
pub trait UpstreamConnector: Clone + Send + Sync + 'static {
    type SnapshotRows: Stream<Item = Result<(String, Row), UpstreamError>> + Send + Unpin;
    type ChangeRows: Stream<Item = Result<RawRow, UpstreamError>> + Send + Unpin;

    /// Read the current contents of `view`, keyed by `key_column`.
    ///
    /// Finite and restartable; each call observes a fresh consistent state.
    fn snapshot(
        &self,
        view: &str,
        key_column: &str,
    ) -> impl Future<Output = Result<(Arc<ViewSchema>, Self::SnapshotRows), UpstreamError>> + Send;

    /// Open the differential stream for `view`.
    ///
    /// The stream is infinite in the healthy case and yields an error (or
    /// terminates) only on connection loss.
    fn subscribe(
        &self,
        view: &str,
        options: SubscribeOptions,
    ) -> impl Future<Output = Result<(Arc<ViewSchema>, Self::ChangeRows), UpstreamError>> + Send;

    /// Release any resources held by the handle itself.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
