// relayd: Streams view changes from the upstream engine into the search
// index and the browser broadcast endpoint.

use relayd::config::RelayConfig;
use relayd::connector::PgUpstream;
use relayd::orchestrator::{Orchestrator, RunOutcome};
use relayd::sink::shape::ShapeRegistry;
use std::env;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "relayd starting");

    let cfg = match RelayConfig::from_env() {
        Ok(cfg) => {
            info!(
                pipelines = cfg.descriptors.len(),
                cluster = %cfg.upstream.cluster,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let connector = PgUpstream::new(cfg.upstream.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let orchestrator =
        match Orchestrator::start(connector, cfg, ShapeRegistry::with_builtins(), shutdown_rx)
            .await
        {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                eprintln!("FATAL: failed to start: {}", e);
                std::process::exit(1);
            }
        };
    info!(
        ws = %orchestrator.ws_addr(),
        health = %orchestrator.health_addr(),
        "listening"
    );

    match orchestrator.run().await {
        RunOutcome::Shutdown => info!("relayd shut down gracefully"),
        RunOutcome::AllPipelinesFatal => {
            error!("unrecoverable upstream schema state");
            std::process::exit(2);
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
