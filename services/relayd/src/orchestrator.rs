//! Worker orchestration.
//!
//! Reads the pipeline table, builds one sink per descriptor, and spawns one
//! supervised pipeline per (view, sink) pair, plus the broadcast and health
//! listeners. Owns graceful shutdown: pipelines stop consuming, sink tasks
//! drain, broadcast sessions say bye, listeners stop.

use crate::config::{ConfigError, RelayConfig, SinkKind};
use crate::health::{self, HealthState};
use crate::metrics::Metrics;
use crate::sink::broadcast::{BroadcastHub, BroadcastSink};
use crate::sink::search::SearchSink;
use crate::sink::shape::ShapeRegistry;
use crate::sink::Sink;
use crate::supervisor::{run_supervisor, HealthHandle, PipelineHealth};
use crate::ws::{self, WsState};
use relay_core::connector::UpstreamConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Why the orchestrator returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Graceful shutdown was requested and completed.
    Shutdown,
    /// Every configured pipeline reached a fatal state.
    AllPipelinesFatal,
}

pub struct Orchestrator {
    ws_addr: SocketAddr,
    health_addr: SocketAddr,
    supervisors: JoinSet<()>,
    servers: JoinSet<()>,
    health_rxs: Arc<Vec<watch::Receiver<PipelineHealth>>>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub async fn start<C: UpstreamConnector>(
        connector: C,
        cfg: RelayConfig,
        shapes: ShapeRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConfigError> {
        let metrics = Arc::new(Metrics::default());
        let hub = BroadcastHub::new(&cfg.broadcast, metrics.clone());

        // Register broadcast views up front so clients connecting during the
        // first hydration are accepted rather than told unknown_view.
        for descriptor in &cfg.descriptors {
            if descriptor.sink == SinkKind::Broadcast {
                hub.register_view(&descriptor.view).await;
            }
        }

        let mut supervisors = JoinSet::new();
        let mut health_rxs = Vec::with_capacity(cfg.descriptors.len());
        for descriptor in &cfg.descriptors {
            let shape = shapes
                .resolve(&descriptor.shape)
                .ok_or_else(|| ConfigError::UnknownShape(descriptor.shape.clone()))?;
            let sink = match descriptor.sink {
                SinkKind::Search => Sink::Search(
                    SearchSink::new(&cfg.search, &descriptor.view, shape, metrics.clone())
                        .map_err(|e| {
                            ConfigError::InvalidDescriptor(format!(
                                "search sink for view {:?}: {e}",
                                descriptor.view
                            ))
                        })?,
                ),
                SinkKind::Broadcast => {
                    Sink::Broadcast(BroadcastSink::new(hub.clone(), &descriptor.view, shape))
                }
            };
            let (health, health_rx) = HealthHandle::new(&descriptor.view, descriptor.sink);
            health_rxs.push(health_rx);
            supervisors.spawn(run_supervisor(
                connector.clone(),
                descriptor.clone(),
                cfg.upstream.hydration,
                cfg.max_pending_keys,
                sink,
                cfg.retry,
                shutdown.clone(),
                health,
                metrics.clone(),
            ));
            info!(
                view = %descriptor.view,
                sink = descriptor.sink.as_str(),
                key_column = %descriptor.key_column,
                shape = %descriptor.shape,
                "pipeline spawned"
            );
        }

        let mut servers = JoinSet::new();
        let ws_listener = TcpListener::bind(&cfg.broadcast.listen_addr)
            .await
            .map_err(|e| ConfigError::InvalidVar {
                var: "BROADCAST_LISTEN_ADDR",
                reason: e.to_string(),
            })?;
        let ws_addr = ws_listener.local_addr().map_err(|e| ConfigError::InvalidVar {
            var: "BROADCAST_LISTEN_ADDR",
            reason: e.to_string(),
        })?;
        let ws_router = ws::router(WsState {
            hub: hub.clone(),
            cfg: Arc::new(cfg.broadcast.clone()),
            shutdown: shutdown.clone(),
            metrics: metrics.clone(),
        });
        servers.spawn(serve_until_shutdown(ws_listener, ws_router, shutdown.clone()));

        let health_listener = TcpListener::bind(&cfg.health_listen_addr)
            .await
            .map_err(|e| ConfigError::InvalidVar {
                var: "HEALTH_LISTEN_ADDR",
                reason: e.to_string(),
            })?;
        let health_addr = health_listener
            .local_addr()
            .map_err(|e| ConfigError::InvalidVar {
                var: "HEALTH_LISTEN_ADDR",
                reason: e.to_string(),
            })?;
        let health_rxs = Arc::new(health_rxs);
        let health_router = health::router(HealthState {
            pipelines: health_rxs.clone(),
            metrics: metrics.clone(),
        });
        servers.spawn(serve_until_shutdown(
            health_listener,
            health_router,
            shutdown.clone(),
        ));

        Ok(Orchestrator {
            ws_addr,
            health_addr,
            supervisors,
            servers,
            health_rxs,
            shutdown,
        })
    }

    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    pub fn health_addr(&self) -> SocketAddr {
        self.health_addr
    }

    /// Current health of every pipeline, in descriptor order.
    pub fn pipeline_health(&self) -> Vec<PipelineHealth> {
        self.health_rxs.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Run until shutdown or until every pipeline is fatal.
    pub async fn run(mut self) -> RunOutcome {
        let outcome = loop {
            if *self.shutdown.borrow() {
                break RunOutcome::Shutdown;
            }
            let health = self.pipeline_health();
            if !health.is_empty() && health.iter().all(|p| p.status.is_fatal()) {
                error!("every pipeline is fatal; giving up");
                break RunOutcome::AllPipelinesFatal;
            }
            tokio::select! {
                _ = self.shutdown.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        };

        if outcome == RunOutcome::Shutdown {
            // Pipelines wind down first (sinks drain their queued batches),
            // then the listeners finish closing client sessions.
            while self.supervisors.join_next().await.is_some() {}
            while self.servers.join_next().await.is_some() {}
            info!("orchestrator shut down");
        } else {
            self.supervisors.abort_all();
            self.servers.abort_all();
        }
        outcome
    }
}

async fn serve_until_shutdown(
    listener: TcpListener,
    router: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) {
    let graceful = async move {
        if !*shutdown.borrow() {
            let _ = shutdown.changed().await;
        }
    };
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(graceful)
        .await
    {
        error!(error = %e, "listener failed");
    }
}
