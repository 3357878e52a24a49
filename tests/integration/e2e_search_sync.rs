// End-to-end: scripted upstream → orchestrator → search sink.

use relay_core::backoff::BackoffPolicy;
use relay_core::schema::{Column, ColumnKind, ViewSchema};
use relay_core::value::Scalar;
use relay_test_utils::{MockSearch, ScriptedUpstream};
use relayd::config::{
    parse_descriptors, BroadcastConfig, HydrationMode, PipelineDescriptor, RelayConfig,
    SearchConfig, SinkKind, UpstreamConfig,
};
use relayd::orchestrator::Orchestrator;
use relayd::sink::shape::ShapeRegistry;
use std::collections::BTreeMap;
use std::io::Write;
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

fn order(key: &str, status: &str) -> Vec<Scalar> {
    vec![
        Scalar::String(key.to_owned()),
        Scalar::String(status.to_owned()),
    ]
}

fn test_config(search_url: &str, descriptors: Vec<PipelineDescriptor>) -> RelayConfig {
    RelayConfig {
        upstream: UpstreamConfig {
            url: "postgres://relay@unused:6875/live".to_owned(),
            cluster: "serving".to_owned(),
            hydration: HydrationMode::Subscribe,
            connect_timeout: Duration::from_secs(1),
        },
        search: SearchConfig {
            base_url: search_url.to_owned(),
            bulk_max_docs: 500,
            bulk_max_bytes: 4 * 1024 * 1024,
            hydration_window: 4,
            request_timeout: Duration::from_secs(5),
        },
        broadcast: BroadcastConfig {
            listen_addr: "127.0.0.1:0".to_owned(),
            client_queue_capacity: 1024,
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

fn search_descriptor(view: &str) -> PipelineDescriptor {
    PipelineDescriptor {
        view: view.to_owned(),
        sink: SinkKind::Search,
        key_column: "order_id".to_owned(),
        shape: "identity".to_owned(),
    }
}

async fn wait_docs(mock: &MockSearch, index: &str, expected: &[(&str, &str)]) {
    let want: BTreeMap<String, serde_json::Value> = expected
        .iter()
        .map(|(key, status)| {
            (
                (*key).to_owned(),
                serde_json::json!({"order_id": key, "status": status}),
            )
        })
        .collect();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if mock.docs(index) == want {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "index never converged; wanted {want:?}, have {:?}",
                mock.docs(index)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn upsert_update_delete_reach_the_index_in_batch_order() {
    let mock = MockSearch::start().await.expect("mock search");
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());
    let run = upstream.push_run("orders");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream,
        test_config(&mock.url(), vec![search_descriptor("orders")]),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let handle = tokio::spawn(orchestrator.run());

    run.change(1, 1, order("o1", "NEW"));
    run.progress(1);
    wait_docs(&mock, "orders", &[("o1", "NEW")]).await;
    assert!(mock.created("orders"), "index should be created on hydration");

    run.change(2, -1, order("o1", "NEW"));
    run.change(2, 1, order("o1", "PAID"));
    run.progress(2);
    wait_docs(&mock, "orders", &[("o1", "PAID")]).await;

    run.change(3, -1, order("o1", "PAID"));
    run.progress(3);
    wait_docs(&mock, "orders", &[]).await;

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn cancelling_transaction_ops_never_reach_the_index() {
    let mock = MockSearch::start().await.expect("mock search");
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());
    let run = upstream.push_run("orders");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream,
        test_config(&mock.url(), vec![search_descriptor("orders")]),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let handle = tokio::spawn(orchestrator.run());

    run.progress(1);
    run.change(5, 1, order("a", "X"));
    run.change(5, 1, order("b", "Y"));
    run.change(5, -1, order("a", "X"));
    run.progress(5);
    wait_docs(&mock, "orders", &[("b", "Y")]).await;

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn per_item_rejection_drops_only_that_document_and_counts_it() {
    let mock = MockSearch::start().await.expect("mock search");
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());
    let run = upstream.push_run("orders");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream,
        test_config(&mock.url(), vec![search_descriptor("orders")]),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let health_addr = orchestrator.health_addr();
    let handle = tokio::spawn(orchestrator.run());

    run.change(1, 1, order("gone", "OLD"));
    run.progress(1);
    wait_docs(&mock, "orders", &[("gone", "OLD")]).await;

    mock.reject_key("bad");
    run.change(2, 1, order("good", "NEW"));
    run.change(2, 1, order("bad", "NEW"));
    run.change(2, -1, order("gone", "OLD"));
    run.progress(2);
    wait_docs(&mock, "orders", &[("good", "NEW")]).await;

    // The stream keeps going after the rejection.
    run.change(3, 1, order("after", "NEW"));
    run.progress(3);
    wait_docs(&mock, "orders", &[("after", "NEW"), ("good", "NEW")]).await;

    let metrics = reqwest::get(format!("http://{health_addr}/metrics"))
        .await
        .expect("metrics request")
        .text()
        .await
        .expect("metrics body");
    assert!(
        metrics.contains("relay_sink_items_rejected_total 1"),
        "metrics were: {metrics}"
    );

    // A later hydration picks the dropped document back up.
    mock.clear_rejections();

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn readiness_flips_once_every_pipeline_has_hydrated() {
    let mock = MockSearch::start().await.expect("mock search");
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());
    let run = upstream.push_run("orders");

    // Exercise the descriptor file format end to end.
    let mut descriptor_file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(
        descriptor_file,
        "schema_version = 1\n\n[[pipelines]]\nview = \"orders\"\nsink = \"search\"\nkey_column = \"order_id\"\n"
    )
    .expect("write descriptors");
    let toml_str = std::fs::read_to_string(descriptor_file.path()).expect("read descriptors");
    let descriptors = parse_descriptors(&toml_str).expect("parse descriptors");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream,
        test_config(&mock.url(), descriptors),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let health_addr = orchestrator.health_addr();
    let handle = tokio::spawn(orchestrator.run());

    let readyz = format!("http://{health_addr}/readyz");
    let early = reqwest::get(&readyz).await.expect("readyz request");
    assert_eq!(early.status().as_u16(), 503);

    run.progress(1);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = reqwest::get(&readyz).await.expect("readyz request");
        if response.status().is_success() {
            let body: serde_json::Value = response.json().await.expect("readyz body");
            assert_eq!(body["ready"], serde_json::json!(true));
            assert_eq!(body["pipelines"][0]["hydrated"], serde_json::json!(true));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "readyz never became 200"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}
