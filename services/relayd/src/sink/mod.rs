//! Sink adapters.
//!
//! Both adapters speak the same lifecycle, driven by their pipeline:
//! `begin_hydration` → `hydrate_ops`* → `finish_hydration` → `apply_batch`*.
//! Every reconnect restarts the cycle; hydration is idempotent on both sides.

pub mod broadcast;
pub mod search;
pub mod shape;

use crate::sink::broadcast::BroadcastSink;
use crate::sink::search::SearchSink;
use crate::sink::shape::ShapeError;
use relay_core::event::{FlushBatch, NetOp};
use relay_core::schema::ViewSchema;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink transport: {0}")]
    Transport(String),
    #[error("sink request timed out")]
    Timeout,
    #[error("document shaping failed: {0}")]
    Shape(#[from] ShapeError),
}

impl SinkError {
    /// Transport-level trouble is recoverable by reconnect + rehydrate;
    /// shaping failures are not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SinkError::Shape(_))
    }
}

/// A pipeline's sink, dispatched by kind.
pub enum Sink {
    Search(SearchSink),
    Broadcast(BroadcastSink),
}

impl Sink {
    pub async fn begin_hydration(&mut self, schema: Arc<ViewSchema>) -> Result<(), SinkError> {
        match self {
            Sink::Search(sink) => sink.begin_hydration(schema).await,
            Sink::Broadcast(sink) => sink.begin_hydration(schema).await,
        }
    }

    pub async fn hydrate_ops(&mut self, ops: Vec<NetOp>) -> Result<(), SinkError> {
        match self {
            Sink::Search(sink) => sink.hydrate_ops(ops).await,
            Sink::Broadcast(sink) => sink.hydrate_ops(ops).await,
        }
    }

    pub async fn finish_hydration(&mut self, cutoff_ts: u64) -> Result<(), SinkError> {
        match self {
            Sink::Search(sink) => sink.finish_hydration(cutoff_ts).await,
            Sink::Broadcast(sink) => sink.finish_hydration(cutoff_ts).await,
        }
    }

    pub async fn apply_batch(&mut self, batch: FlushBatch) -> Result<(), SinkError> {
        match self {
            Sink::Search(sink) => sink.apply_batch(batch).await,
            Sink::Broadcast(sink) => sink.apply_batch(batch).await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Sink::Search(sink) => sink.close().await,
            Sink::Broadcast(sink) => sink.close().await,
        }
    }
}
