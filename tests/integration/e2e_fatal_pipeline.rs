// End-to-end: fatal pipelines are isolated; the process only gives up when
// every pipeline is gone.

use relay_core::backoff::BackoffPolicy;
use relay_core::schema::{Column, ColumnKind, ViewSchema};
use relay_core::value::Scalar;
use relay_test_utils::{ScriptedUpstream, WsProbe};
use relayd::config::{
    BroadcastConfig, HydrationMode, PipelineDescriptor, RelayConfig, SearchConfig, SinkKind,
    UpstreamConfig,
};
use relayd::orchestrator::{Orchestrator, RunOutcome};
use relayd::sink::shape::ShapeRegistry;
use std::time::Duration;
use tokio::sync::watch;

fn orders_schema() -> ViewSchema {
    ViewSchema::new(
        "orders",
        vec![
            Column::new("order_id", ColumnKind::String),
            Column::new("status", ColumnKind::String),
        ],
    )
}

fn descriptor(view: &str, sink: SinkKind) -> PipelineDescriptor {
    PipelineDescriptor {
        view: view.to_owned(),
        sink,
        key_column: "order_id".to_owned(),
        shape: "identity".to_owned(),
    }
}

fn test_config(descriptors: Vec<PipelineDescriptor>) -> RelayConfig {
    RelayConfig {
        upstream: UpstreamConfig {
            url: "postgres://relay@unused:6875/live".to_owned(),
            cluster: "serving".to_owned(),
            hydration: HydrationMode::Subscribe,
            connect_timeout: Duration::from_secs(1),
        },
        search: SearchConfig {
            base_url: "http://127.0.0.1:9".to_owned(),
            bulk_max_docs: 500,
            bulk_max_bytes: 4 * 1024 * 1024,
            hydration_window: 4,
            request_timeout: Duration::from_secs(5),
        },
        broadcast: BroadcastConfig {
            listen_addr: "127.0.0.1:0".to_owned(),
            client_queue_capacity: 64,
            ping_interval: Duration::from_secs(15),
            snapshot_chunk_rows: 500,
        },
        retry: BackoffPolicy {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(100),
            multiplier: 2.0,
        },
        max_pending_keys: 100_000,
        health_listen_addr: "127.0.0.1:0".to_owned(),
        descriptors,
    }
}

#[tokio::test]
async fn schema_error_halts_one_pipeline_while_the_rest_serve() {
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());
    let run = upstream.push_run("orders");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream,
        test_config(vec![
            descriptor("orders", SinkKind::Broadcast),
            descriptor("nonexistent", SinkKind::Search),
        ]),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let ws_addr = orchestrator.ws_addr();
    let health_addr = orchestrator.health_addr();
    let handle = tokio::spawn(orchestrator.run());

    run.change(1, 1, vec![
        Scalar::String("o1".to_owned()),
        Scalar::String("NEW".to_owned()),
    ]);
    run.progress(1);

    // livez goes 503 with the broken pipeline marked fatal and the healthy
    // one streaming.
    let livez_url = format!("http://{health_addr}/livez");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let body = loop {
        let response = reqwest::get(&livez_url).await.expect("livez request");
        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.expect("livez body");
        let fatal_seen = body["pipelines"]
            .as_array()
            .map(|pipelines| {
                pipelines.iter().any(|p| {
                    p["view"] == serde_json::json!("nonexistent")
                        && p["status"] == serde_json::json!("fatal")
                })
            })
            .unwrap_or(false);
        if status == 503 && fatal_seen {
            break body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "fatal pipeline never surfaced; last body {body}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    let orders_entry = body["pipelines"]
        .as_array()
        .expect("pipelines array")
        .iter()
        .find(|p| p["view"] == serde_json::json!("orders") )
        .expect("orders entry")
        .clone();
    assert_ne!(orders_entry["status"], serde_json::json!("fatal"));

    // healthz stays green and the process does not exit.
    let healthz = reqwest::get(format!("http://{health_addr}/healthz"))
        .await
        .expect("healthz request");
    assert!(healthz.status().is_success());
    assert!(!handle.is_finished(), "process must not exit for one fatal pipeline");

    // The healthy broadcast pipeline still serves clients.
    let mut probe = WsProbe::connect_and_hello(ws_addr, &["orders"])
        .await
        .expect("connect probe");
    let snapshot = probe
        .collect_snapshot("orders", Duration::from_secs(5))
        .await
        .expect("snapshot from healthy pipeline");
    assert!(snapshot.contains_key("o1"));

    let _ = shutdown_tx.send(true);
    assert_eq!(
        handle.await.expect("orchestrator should finish"),
        RunOutcome::Shutdown
    );
}

#[tokio::test]
async fn process_gives_up_only_when_every_pipeline_is_fatal() {
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream,
        test_config(vec![descriptor("nonexistent", SinkKind::Search)]),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let handle = tokio::spawn(orchestrator.run());

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("orchestrator should give up")
        .expect("orchestrator should not panic");
    assert_eq!(outcome, RunOutcome::AllPipelinesFatal);
}
