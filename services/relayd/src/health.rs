//! Health probes and counters.
//!
//! - `GET /healthz` — process is running; always 200.
//! - `GET /readyz`  — 200 once every pipeline has completed a hydration.
//! - `GET /livez`   — 200 while no pipeline is fatal or stopped.
//! - `GET /metrics` — plain-text counters.
//!
//! A fatal pipeline makes livez 503 but never exits the process by itself;
//! the orchestrator only gives up when every pipeline is fatal.

use crate::metrics::Metrics;
use crate::supervisor::{PipelineHealth, PipelineStatus};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct HealthState {
    pub pipelines: Arc<Vec<watch::Receiver<PipelineHealth>>>,
    pub metrics: Arc<Metrics>,
}

impl HealthState {
    pub fn snapshot(&self) -> Vec<PipelineHealth> {
        self.pipelines.iter().map(|rx| rx.borrow().clone()).collect()
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn pipeline_json(health: &PipelineHealth) -> serde_json::Value {
    let mut entry = serde_json::json!({
        "view": health.view,
        "sink": health.sink.as_str(),
        "status": health.status.label(),
        "hydrated": health.hydrated_once,
    });
    if let PipelineStatus::Fatal { reason } = &health.status {
        entry["reason"] = serde_json::Value::String(reason.clone());
    }
    entry
}

async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    let pipelines = state.snapshot();
    let ready = pipelines.iter().all(|p| p.hydrated_once);
    let body = serde_json::json!({
        "ready": ready,
        "pipelines": pipelines.iter().map(pipeline_json).collect::<Vec<_>>(),
    });
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn livez(State(state): State<HealthState>) -> impl IntoResponse {
    let pipelines = state.snapshot();
    let live = pipelines
        .iter()
        .all(|p| !matches!(p.status, PipelineStatus::Fatal { .. } | PipelineStatus::Stopped));
    let body = serde_json::json!({
        "live": live,
        "pipelines": pipelines.iter().map(pipeline_json).collect::<Vec<_>>(),
    });
    let status = if live {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn metrics(State(state): State<HealthState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render())
}
