// End-to-end: upstream connection loss, supervisor reconnect, rehydration.

use relay_core::backoff::BackoffPolicy;
use relay_core::schema::{Column, ColumnKind, ViewSchema};
use relay_core::value::{Row, Scalar};
use relay_test_utils::{MockSearch, ScriptedUpstream};
use relayd::config::{
    BroadcastConfig, HydrationMode, PipelineDescriptor, RelayConfig, SearchConfig, SinkKind,
    UpstreamConfig,
};
use relayd::orchestrator::Orchestrator;
use relayd::sink::shape::ShapeRegistry;
use std::collections::BTreeMap;
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

fn test_config(search_url: &str, hydration: HydrationMode) -> RelayConfig {
    RelayConfig {
        upstream: UpstreamConfig {
            url: "postgres://relay@unused:6875/live".to_owned(),
            cluster: "serving".to_owned(),
            hydration,
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
        descriptors: vec![PipelineDescriptor {
            view: "orders".to_owned(),
            sink: SinkKind::Search,
            key_column: "order_id".to_owned(),
            shape: "identity".to_owned(),
        }],
    }
}

async fn wait_docs(mock: &MockSearch, expected: &[(&str, &str)]) {
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
        if mock.docs("orders") == want {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "index never converged; wanted {want:?}, have {:?}",
                mock.docs("orders")
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn mid_stream_disconnect_rehydrates_and_final_state_matches() {
    let mock = MockSearch::start().await.expect("mock search");
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());
    let first_run = upstream.push_run("orders");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream.clone(),
        test_config(&mock.url(), HydrationMode::Subscribe),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let handle = tokio::spawn(orchestrator.run());

    first_run.change(1, 1, order("o1", "NEW"));
    first_run.progress(1);
    first_run.change(2, -1, order("o1", "NEW"));
    first_run.change(2, 1, order("o1", "PAID"));
    first_run.progress(2);
    wait_docs(&mock, &[("o1", "PAID")]).await;

    // Connection dies after the second progress mark. The replacement run
    // serves the same upstream state, then the change that was in flight.
    upstream.set_snapshot("orders", vec![Row(order("o1", "PAID"))]);
    let second_run = upstream.push_run("orders");
    first_run.disconnect();

    second_run.progress(2);
    second_run.change(3, -1, order("o1", "PAID"));
    second_run.progress(3);
    wait_docs(&mock, &[]).await;
    assert!(
        upstream.subscribe_calls() >= 2,
        "supervisor should have resubscribed"
    );

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn rehydration_deletes_documents_whose_keys_vanished_upstream() {
    let mock = MockSearch::start().await.expect("mock search");
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());
    let first_run = upstream.push_run("orders");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream.clone(),
        test_config(&mock.url(), HydrationMode::Subscribe),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let handle = tokio::spawn(orchestrator.run());

    first_run.change(1, 1, order("kept", "NEW"));
    first_run.change(1, 1, order("ghost", "NEW"));
    first_run.progress(1);
    wait_docs(&mock, &[("ghost", "NEW"), ("kept", "NEW")]).await;

    // While disconnected, "ghost" is deleted upstream; the change itself is
    // never replayed, only the post-outage snapshot shows it.
    upstream.set_snapshot("orders", vec![Row(order("kept", "NEW"))]);
    let second_run = upstream.push_run("orders");
    first_run.disconnect();

    second_run.progress(5);
    wait_docs(&mock, &[("kept", "NEW")]).await;

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn separate_hydration_mode_reconnects_through_snapshot_reads() {
    let mock = MockSearch::start().await.expect("mock search");
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());
    upstream.set_snapshot("orders", vec![Row(order("o1", "NEW"))]);
    let first_run = upstream.push_run("orders");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream.clone(),
        test_config(&mock.url(), HydrationMode::Separate),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let handle = tokio::spawn(orchestrator.run());

    first_run.progress(1);
    wait_docs(&mock, &[("o1", "NEW")]).await;
    assert_eq!(upstream.snapshot_calls(), 1);

    let second_run = upstream.push_run("orders");
    first_run.disconnect();

    second_run.progress(2);
    second_run.change(3, 1, order("o2", "NEW"));
    second_run.progress(3);
    wait_docs(&mock, &[("o1", "NEW"), ("o2", "NEW")]).await;
    assert!(upstream.snapshot_calls() >= 2, "rehydration must re-read the snapshot");

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}
