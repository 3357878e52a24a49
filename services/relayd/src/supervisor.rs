//! Per-pipeline retry supervision.
//!
//! Each pipeline runs inside one supervisor loop: connect, hydrate, stream,
//! and on transient failure sleep with exponential backoff and start over.
//! The backoff resets whenever an attempt applied at least one progress mark
//! to its sink, so a long-lived connection that finally drops reconnects
//! quickly. Protocol and shaping errors are fatal for the pipeline only; the
//! rest of the process keeps running and the health probes expose the state.

use crate::config::{HydrationMode, PipelineDescriptor, SinkKind};
use crate::metrics::Metrics;
use crate::pipeline::{run_attempt, AttemptReport};
use crate::sink::Sink;
use relay_core::backoff::{Backoff, BackoffPolicy};
use relay_core::connector::UpstreamConnector;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Published pipeline state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStatus {
    Initializing,
    Hydrating,
    Streaming,
    Reconnecting { attempt: u32 },
    Fatal { reason: String },
    Stopped,
}

impl PipelineStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineStatus::Initializing => "initializing",
            PipelineStatus::Hydrating => "hydrating",
            PipelineStatus::Streaming => "streaming",
            PipelineStatus::Reconnecting { .. } => "reconnecting",
            PipelineStatus::Fatal { .. } => "fatal",
            PipelineStatus::Stopped => "stopped",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineStatus::Fatal { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineHealth {
    pub view: String,
    pub sink: SinkKind,
    pub status: PipelineStatus,
    pub hydrated_once: bool,
}

/// Shared writer for one pipeline's health record. The sink task flips
/// `hydrated_once` the moment hydration lands, so readiness does not wait
/// for the attempt to end.
#[derive(Clone)]
pub struct HealthHandle {
    tx: Arc<watch::Sender<PipelineHealth>>,
}

impl HealthHandle {
    pub fn new(view: &str, sink: SinkKind) -> (Self, watch::Receiver<PipelineHealth>) {
        let (tx, rx) = watch::channel(PipelineHealth {
            view: view.to_owned(),
            sink,
            status: PipelineStatus::Initializing,
            hydrated_once: false,
        });
        (HealthHandle { tx: Arc::new(tx) }, rx)
    }

    pub fn set_status(&self, status: PipelineStatus) {
        self.tx.send_modify(|health| health.status = status);
    }

    pub fn mark_hydrated(&self) {
        self.tx.send_modify(|health| health.hydrated_once = true);
    }
}

// ---------------------------------------------------------------------------
// Supervisor loop
// ---------------------------------------------------------------------------

pub async fn run_supervisor<C: UpstreamConnector>(
    connector: C,
    descriptor: PipelineDescriptor,
    hydration: HydrationMode,
    max_pending_keys: usize,
    mut sink: Sink,
    policy: BackoffPolicy,
    mut shutdown: watch::Receiver<bool>,
    health: HealthHandle,
    metrics: Arc<Metrics>,
) {
    let mut backoff = Backoff::new(policy);
    let mut attempt: u32 = 0;
    let mut fatal = false;

    while !*shutdown.borrow() {
        attempt += 1;
        health.set_status(PipelineStatus::Hydrating);
        let started = Instant::now();
        let (returned_sink, report) = run_attempt(
            &connector,
            &descriptor,
            hydration,
            max_pending_keys,
            sink,
            &mut shutdown,
            &health,
            &metrics,
        )
        .await;
        match returned_sink {
            Some(s) => sink = s,
            None => {
                error!(
                    view = %descriptor.view,
                    sink = descriptor.sink.as_str(),
                    "sink task aborted; halting pipeline"
                );
                health.set_status(PipelineStatus::Fatal {
                    reason: "sink task aborted".to_owned(),
                });
                connector.close().await;
                return;
            }
        }

        let AttemptReport { progressed, error } = report;
        let Some(error) = error else {
            break; // clean cancellation
        };
        if *shutdown.borrow() {
            break;
        }
        if error.is_fatal() {
            error!(
                view = %descriptor.view,
                sink = descriptor.sink.as_str(),
                kind = error.kind(),
                error = %error,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pipeline failed fatally"
            );
            health.set_status(PipelineStatus::Fatal {
                reason: error.to_string(),
            });
            fatal = true;
            break;
        }

        Metrics::incr(&metrics.reconnects);
        if progressed {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        health.set_status(PipelineStatus::Reconnecting { attempt });
        warn!(
            view = %descriptor.view,
            sink = descriptor.sink.as_str(),
            kind = error.kind(),
            error = %error,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting after transient failure"
        );
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if !fatal {
        health.set_status(PipelineStatus::Stopped);
    }
    sink.close().await;
    connector.close().await;
    info!(
        view = %descriptor.view,
        sink = descriptor.sink.as_str(),
        "pipeline stopped"
    );
}
