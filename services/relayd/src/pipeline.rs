//! One synchronization pipeline attempt.
//!
//! The chain (connector → decoder → consolidator) runs as one task; the sink
//! adapter runs in a second task behind a bounded command channel, so a slow
//! sink backpressures the chain and, through it, the upstream socket.
//! Batches reach the sink strictly in timestamp order.
//!
//! An attempt ends on cancellation or on the first error; classification
//! (transient vs fatal) is the supervisor's job.

use crate::config::{HydrationMode, PipelineDescriptor};
use crate::metrics::Metrics;
use crate::sink::{Sink, SinkError};
use crate::supervisor::{HealthHandle, PipelineStatus};
use futures_util::{Stream, StreamExt};
use relay_core::connector::{SubscribeOptions, UpstreamConnector};
use relay_core::decode::Decoder;
use relay_core::error::{ProtocolError, UpstreamError};
use relay_core::event::{FlushBatch, NetOp, RawRow, ViewEvent};
use relay_core::schema::ViewSchema;
use relay_core::Consolidator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// FlushBatches buffered between the chain and the sink task.
pub const SINK_CHANNEL_CAPACITY: usize = 32;
/// Rows per hydration chunk handed to the sink.
pub const HYDRATE_CHUNK_ROWS: usize = 500;
/// How long a saturated chain holds off the socket before each further read.
const SATURATION_PAUSE: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// The sink task stopped while the chain was still running; the sink's
    /// own error replaces this when the attempt is reported.
    #[error("sink task stopped")]
    SinkClosed,
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Upstream(e) => !e.is_transient(),
            PipelineError::Protocol(_) => true,
            PipelineError::Sink(e) => !e.is_transient(),
            PipelineError::SinkClosed => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Upstream(_) => "upstream",
            PipelineError::Protocol(_) => "protocol",
            PipelineError::Sink(_) | PipelineError::SinkClosed => "sink",
        }
    }
}

/// What one attempt came to.
pub struct AttemptReport {
    /// Whether at least one hydration or batch landed in the sink.
    pub progressed: bool,
    /// `None` means the attempt ended by cancellation.
    pub error: Option<PipelineError>,
}

// ---------------------------------------------------------------------------
// Sink task
// ---------------------------------------------------------------------------

/// Commands crossing the chain → sink channel.
pub enum SinkCmd {
    BeginHydration { schema: Arc<ViewSchema> },
    HydrateOps(Vec<NetOp>),
    FinishHydration { cutoff_ts: u64 },
    Batch(FlushBatch),
}

struct SinkRun {
    sink: Sink,
    progressed: bool,
    error: Option<SinkError>,
}

async fn run_sink_task(
    mut sink: Sink,
    mut rx: mpsc::Receiver<SinkCmd>,
    health: HealthHandle,
    metrics: Arc<Metrics>,
) -> SinkRun {
    let mut progressed = false;
    while let Some(cmd) = rx.recv().await {
        let result = match cmd {
            SinkCmd::BeginHydration { schema } => sink.begin_hydration(schema).await,
            SinkCmd::HydrateOps(ops) => sink.hydrate_ops(ops).await,
            SinkCmd::FinishHydration { cutoff_ts } => {
                let result = sink.finish_hydration(cutoff_ts).await;
                if result.is_ok() {
                    progressed = true;
                    health.mark_hydrated();
                    Metrics::incr(&metrics.hydrations_completed);
                }
                result
            }
            SinkCmd::Batch(batch) => {
                let result = sink.apply_batch(batch).await;
                if result.is_ok() {
                    progressed = true;
                    Metrics::incr(&metrics.batches_applied);
                }
                result
            }
        };
        if let Err(error) = result {
            rx.close();
            return SinkRun {
                sink,
                progressed,
                error: Some(error),
            };
        }
    }
    SinkRun {
        sink,
        progressed,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Attempt runner
// ---------------------------------------------------------------------------

/// Run one connect-hydrate-stream attempt to completion.
///
/// Returns the sink for reuse by the next attempt (`None` only if the sink
/// task aborted) and the attempt report.
pub async fn run_attempt<C: UpstreamConnector>(
    connector: &C,
    descriptor: &PipelineDescriptor,
    hydration: HydrationMode,
    max_pending_keys: usize,
    sink: Sink,
    shutdown: &mut watch::Receiver<bool>,
    health: &HealthHandle,
    metrics: &Arc<Metrics>,
) -> (Option<Sink>, AttemptReport) {
    let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
    let sink_task = tokio::spawn(run_sink_task(sink, rx, health.clone(), metrics.clone()));

    let chain_error = run_chain(
        connector,
        descriptor,
        hydration,
        max_pending_keys,
        &tx,
        shutdown,
        health,
    )
    .await
    .err();
    drop(tx);

    match sink_task.await {
        Err(join_error) => (
            None,
            AttemptReport {
                progressed: false,
                error: Some(PipelineError::Sink(SinkError::Transport(
                    join_error.to_string(),
                ))),
            },
        ),
        Ok(SinkRun {
            sink,
            progressed,
            error: sink_error,
        }) => (
            Some(sink),
            AttemptReport {
                progressed,
                error: combine_errors(chain_error, sink_error),
            },
        ),
    }
}

/// The sink's own failure outranks the chain's derived `SinkClosed`; a fatal
/// chain error outranks a transient sink one.
fn combine_errors(
    chain: Option<PipelineError>,
    sink: Option<SinkError>,
) -> Option<PipelineError> {
    match (chain, sink) {
        (chain, Some(sink_error)) => match chain {
            None | Some(PipelineError::SinkClosed) => Some(PipelineError::Sink(sink_error)),
            Some(other) if other.is_fatal() => Some(other),
            Some(_) => Some(PipelineError::Sink(sink_error)),
        },
        (chain, None) => chain,
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

enum ChainStep {
    Continue,
    Cancelled,
}

enum Next {
    Cancelled,
    Row(RawRow),
}

async fn run_chain<C: UpstreamConnector>(
    connector: &C,
    descriptor: &PipelineDescriptor,
    hydration: HydrationMode,
    max_pending_keys: usize,
    tx: &mpsc::Sender<SinkCmd>,
    shutdown: &mut watch::Receiver<bool>,
    health: &HealthHandle,
) -> Result<(), PipelineError> {
    let mut consolidator = Consolidator::new(max_pending_keys);

    let (decoder, mut rows) = match hydration {
        HydrationMode::Subscribe => {
            let (schema, mut rows) = connector
                .subscribe(
                    &descriptor.view,
                    SubscribeOptions {
                        with_progress: true,
                        emit_snapshot: true,
                    },
                )
                .await?;
            let decoder = Decoder::new(schema.clone(), &descriptor.key_column)?;
            send_cmd(tx, SinkCmd::BeginHydration { schema }).await?;
            if let ChainStep::Cancelled =
                hydrate_from_prefix(&mut rows, &decoder, &mut consolidator, tx, shutdown).await?
            {
                return Ok(());
            }
            (decoder, rows)
        }
        HydrationMode::Separate => {
            let (schema, mut snapshot_rows) = connector
                .snapshot(&descriptor.view, &descriptor.key_column)
                .await?;
            send_cmd(tx, SinkCmd::BeginHydration { schema }).await?;
            let mut chunk = Vec::with_capacity(HYDRATE_CHUNK_ROWS);
            loop {
                if *shutdown.borrow() {
                    return Ok(());
                }
                match snapshot_rows.next().await {
                    None => break,
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok((key, row))) => {
                        chunk.push(NetOp::Upsert { key, row });
                        if chunk.len() >= HYDRATE_CHUNK_ROWS {
                            send_cmd(tx, SinkCmd::HydrateOps(std::mem::take(&mut chunk))).await?;
                        }
                    }
                }
            }
            let (schema, mut rows) = connector
                .subscribe(
                    &descriptor.view,
                    SubscribeOptions {
                        with_progress: true,
                        emit_snapshot: false,
                    },
                )
                .await?;
            let decoder = Decoder::new(schema, &descriptor.key_column)?;
            // The first progress mark after subscribing is the hydration
            // cutoff; changes before it fold into the hydrated state.
            if let ChainStep::Cancelled = close_hydration(
                &mut rows,
                &decoder,
                &mut consolidator,
                chunk,
                tx,
                shutdown,
            )
            .await?
            {
                return Ok(());
            }
            (decoder, rows)
        }
    };

    health.set_status(PipelineStatus::Streaming);
    let result = stream_changes(&mut rows, &decoder, &mut consolidator, tx, shutdown).await;
    if result.is_err() {
        let dropped = consolidator.discard_pending();
        if dropped > 0 {
            debug!(
                view = %descriptor.view,
                dropped,
                "discarded uncommitted progress window"
            );
        }
    }
    result.map(|_| ())
}

/// Hydrate from the snapshot prefix of a subscribe stream, up to and
/// including the first progress mark.
async fn hydrate_from_prefix<S>(
    rows: &mut S,
    decoder: &Decoder,
    consolidator: &mut Consolidator,
    tx: &mpsc::Sender<SinkCmd>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ChainStep, PipelineError>
where
    S: Stream<Item = Result<RawRow, UpstreamError>> + Unpin,
{
    let mut chunk = Vec::with_capacity(HYDRATE_CHUNK_ROWS);
    loop {
        let raw = match next_row(rows, shutdown, consolidator.is_saturated()).await? {
            Next::Cancelled => return Ok(ChainStep::Cancelled),
            Next::Row(raw) => raw,
        };
        match decoder.decode(raw)? {
            ViewEvent::Snapshot { key, row } => {
                chunk.push(NetOp::Upsert { key, row });
                if chunk.len() >= HYDRATE_CHUNK_ROWS {
                    send_cmd(tx, SinkCmd::HydrateOps(std::mem::take(&mut chunk))).await?;
                }
            }
            // Changes interleaved before the first progress mark belong to
            // the first window and land in the hydrated state.
            event @ ViewEvent::Change { .. } => {
                consolidator.push(event)?;
            }
            ViewEvent::Progress { ts } => {
                if let Some(batch) = consolidator.push(ViewEvent::Progress { ts })? {
                    chunk.extend(batch.ops);
                }
                if !chunk.is_empty() {
                    send_cmd(tx, SinkCmd::HydrateOps(chunk)).await?;
                }
                send_cmd(tx, SinkCmd::FinishHydration { cutoff_ts: ts }).await?;
                return Ok(ChainStep::Continue);
            }
        }
    }
}

/// Separate-snapshot epilogue: consume the live stream until the first
/// progress mark, folding early changes into the hydration chunk.
async fn close_hydration<S>(
    rows: &mut S,
    decoder: &Decoder,
    consolidator: &mut Consolidator,
    mut chunk: Vec<NetOp>,
    tx: &mpsc::Sender<SinkCmd>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ChainStep, PipelineError>
where
    S: Stream<Item = Result<RawRow, UpstreamError>> + Unpin,
{
    loop {
        let raw = match next_row(rows, shutdown, consolidator.is_saturated()).await? {
            Next::Cancelled => return Ok(ChainStep::Cancelled),
            Next::Row(raw) => raw,
        };
        match decoder.decode(raw)? {
            ViewEvent::Progress { ts } => {
                if let Some(batch) = consolidator.push(ViewEvent::Progress { ts })? {
                    chunk.extend(batch.ops);
                }
                if !chunk.is_empty() {
                    send_cmd(tx, SinkCmd::HydrateOps(chunk)).await?;
                }
                send_cmd(tx, SinkCmd::FinishHydration { cutoff_ts: ts }).await?;
                return Ok(ChainStep::Continue);
            }
            event => {
                consolidator.push(event)?;
            }
        }
    }
}

async fn stream_changes<S>(
    rows: &mut S,
    decoder: &Decoder,
    consolidator: &mut Consolidator,
    tx: &mpsc::Sender<SinkCmd>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ChainStep, PipelineError>
where
    S: Stream<Item = Result<RawRow, UpstreamError>> + Unpin,
{
    loop {
        let raw = match next_row(rows, shutdown, consolidator.is_saturated()).await? {
            Next::Cancelled => return Ok(ChainStep::Cancelled),
            Next::Row(raw) => raw,
        };
        let event = decoder.decode(raw)?;
        if let Some(batch) = consolidator.push(event)? {
            send_cmd(tx, SinkCmd::Batch(batch)).await?;
        }
    }
}

/// Pull the next raw row, yielding to cancellation at the suspension point.
///
/// While the consolidator is saturated the chain stops reading ahead: every
/// further read is held off, so the socket backs up and the engine sees
/// backpressure until the next progress mark drains the pending buffer. The
/// draining mark arrives on this same stream, so reads are throttled to a
/// held-off trickle rather than stopped outright.
async fn next_row<S>(
    rows: &mut S,
    shutdown: &mut watch::Receiver<bool>,
    saturated: bool,
) -> Result<Next, PipelineError>
where
    S: Stream<Item = Result<RawRow, UpstreamError>> + Unpin,
{
    loop {
        if *shutdown.borrow() {
            return Ok(Next::Cancelled);
        }
        if saturated {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(Next::Cancelled);
                    }
                    continue;
                }
                _ = tokio::time::sleep(SATURATION_PAUSE) => {}
            }
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(Next::Cancelled);
                }
            }
            item = rows.next() => {
                return match item {
                    None => Err(UpstreamError::StreamEnded.into()),
                    Some(Err(e)) => Err(e.into()),
                    Some(Ok(raw)) => Ok(Next::Row(raw)),
                };
            }
        }
    }
}

async fn send_cmd(tx: &mpsc::Sender<SinkCmd>, cmd: SinkCmd) -> Result<(), PipelineError> {
    tx.send(cmd).await.map_err(|_| PipelineError::SinkClosed)
}
