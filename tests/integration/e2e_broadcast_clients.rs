// End-to-end: scripted upstream → orchestrator → /sync WebSocket clients.

use relay_core::backoff::BackoffPolicy;
use relay_core::schema::{Column, ColumnKind, ViewSchema};
use relay_core::value::Scalar;
use relay_protocol::{close_reasons, SyncFrame};
use relay_test_utils::{ProbeError, ScriptedUpstream, WsProbe};
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

fn order(key: &str, status: &str) -> Vec<Scalar> {
    vec![
        Scalar::String(key.to_owned()),
        Scalar::String(status.to_owned()),
    ]
}

fn test_config(queue_capacity: usize, ping_interval: Duration) -> RelayConfig {
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
            client_queue_capacity: queue_capacity,
            ping_interval,
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
            sink: SinkKind::Broadcast,
            key_column: "order_id".to_owned(),
            shape: "identity".to_owned(),
        }],
    }
}

struct Stack {
    upstream: ScriptedUpstream,
    ws_addr: std::net::SocketAddr,
    health_addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<RunOutcome>,
}

async fn start_stack(queue_capacity: usize, ping_interval: Duration) -> Stack {
    let upstream = ScriptedUpstream::new();
    upstream.add_view(orders_schema());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::start(
        upstream.clone(),
        test_config(queue_capacity, ping_interval),
        ShapeRegistry::with_builtins(),
        shutdown_rx,
    )
    .await
    .expect("start orchestrator");
    let ws_addr = orchestrator.ws_addr();
    let health_addr = orchestrator.health_addr();
    let handle = tokio::spawn(orchestrator.run());
    Stack {
        upstream,
        ws_addr,
        health_addr,
        shutdown_tx,
        handle,
    }
}

/// Reconnect until a fresh subscription's snapshot matches `expected`.
async fn probe_with_snapshot(
    ws_addr: std::net::SocketAddr,
    expected: &[(&str, &str)],
) -> WsProbe {
    let want: std::collections::BTreeMap<String, serde_json::Value> = expected
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
        let mut probe = WsProbe::connect_and_hello(ws_addr, &["orders"])
            .await
            .expect("connect probe");
        let snapshot = probe
            .collect_snapshot("orders", Duration::from_secs(2))
            .await
            .expect("collect snapshot");
        if snapshot == want {
            return probe;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "snapshot never converged; wanted {want:?}, have {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn late_subscriber_gets_snapshot_then_only_newer_deltas() {
    let stack = start_stack(1024, Duration::from_secs(15)).await;
    let run = stack.upstream.push_run("orders");

    run.change(1, 1, order("o1", "NEW"));
    run.progress(1);
    run.change(2, -1, order("o1", "NEW"));
    run.change(2, 1, order("o1", "PAID"));
    run.progress(2);

    // Connecting after the second batch: snapshot reflects it, and the next
    // frame is the delete delta, not a replay of earlier upserts.
    let mut probe = probe_with_snapshot(stack.ws_addr, &[("o1", "PAID")]).await;

    run.change(3, -1, order("o1", "PAID"));
    run.progress(3);
    let (view, ts, upserts, deletes) = probe
        .next_delta(Duration::from_secs(5))
        .await
        .expect("delete delta");
    assert_eq!(view, "orders");
    assert_eq!(ts, 3);
    assert!(upserts.is_empty());
    assert_eq!(deletes, vec!["o1".to_owned()]);

    let _ = stack.shutdown_tx.send(true);
    let _ = stack.handle.await;
}

#[tokio::test]
async fn malformed_hello_and_unknown_view_close_with_policy_violation() {
    let stack = start_stack(64, Duration::from_secs(15)).await;

    let mut bad = WsProbe::connect(stack.ws_addr).await.expect("connect");
    bad.send_raw("{definitely not json").await.expect("send raw");
    let (code, reason) = bad
        .expect_close(Duration::from_secs(5))
        .await
        .expect("close frame");
    assert_eq!(code, 1008);
    assert_eq!(reason, close_reasons::BAD_HELLO);

    let mut unknown = WsProbe::connect(stack.ws_addr).await.expect("connect");
    unknown.hello(&["no_such_view"]).await.expect("hello");
    let (code, reason) = unknown
        .expect_close(Duration::from_secs(5))
        .await
        .expect("close frame");
    assert_eq!(code, 1008);
    assert_eq!(reason, close_reasons::UNKNOWN_VIEW);

    let _ = stack.shutdown_tx.send(true);
    let _ = stack.handle.await;
}

#[tokio::test]
async fn silent_client_is_disconnected_after_missing_a_pong() {
    let stack = start_stack(64, Duration::from_millis(200)).await;
    let run = stack.upstream.push_run("orders");
    run.progress(1);

    // A ponging client survives several ping intervals.
    let mut polite = probe_with_snapshot(stack.ws_addr, &[]).await;
    match polite.next_frame(Duration::from_millis(700)).await {
        Err(ProbeError::Timeout) => {}
        other => panic!("expected to stay connected (timeout), got {other:?}"),
    }

    // A client that never pongs is dropped within two intervals.
    let mut silent = probe_with_snapshot(stack.ws_addr, &[]).await;
    silent.auto_pong = false;
    match silent.next_frame(Duration::from_secs(5)).await {
        Ok(SyncFrame::Ping) => match silent.next_frame(Duration::from_secs(5)).await {
            Err(ProbeError::Closed { .. }) => {}
            other => panic!("expected disconnect after missed pong, got {other:?}"),
        },
        Err(ProbeError::Closed { .. }) => {}
        other => panic!("expected ping then disconnect, got {other:?}"),
    }

    let _ = stack.shutdown_tx.send(true);
    let _ = stack.handle.await;
}

#[tokio::test]
async fn slow_consumer_is_terminated_alone_and_the_pipeline_never_stalls() {
    const DELTAS: u64 = 1000;
    let padding = "x".repeat(4096);

    let stack = start_stack(256, Duration::from_secs(30)).await;
    let run = stack.upstream.push_run("orders");
    run.progress(1);

    let fast = probe_with_snapshot(stack.ws_addr, &[]).await;
    let mut slow = probe_with_snapshot(stack.ws_addr, &[]).await;

    // The fast client drains continuously in the background.
    let fast_reader = tokio::spawn(async move {
        let mut fast = fast;
        let mut timestamps = Vec::with_capacity(DELTAS as usize);
        while timestamps.len() < DELTAS as usize {
            let (_, ts, _, _) = fast
                .next_delta(Duration::from_secs(10))
                .await
                .expect("fast client delta");
            timestamps.push(ts);
        }
        (fast, timestamps)
    });

    // The slow client stops reading entirely while deltas pour in.
    for i in 0..DELTAS {
        let ts = 10 + i;
        run.change(
            ts,
            1,
            vec![
                Scalar::String(format!("k{i}")),
                Scalar::String(padding.clone()),
            ],
        );
        run.progress(ts);
    }

    let (mut fast, timestamps) = tokio::time::timeout(Duration::from_secs(30), fast_reader)
        .await
        .expect("fast client should receive everything")
        .expect("fast reader should not panic");
    assert_eq!(timestamps.len(), DELTAS as usize);
    assert!(
        timestamps.windows(2).all(|w| w[0] < w[1]),
        "delta timestamps must be strictly increasing"
    );

    let (code, reason) = slow
        .expect_close(Duration::from_secs(10))
        .await
        .expect("slow client should be closed");
    assert_eq!(code, 1008);
    assert_eq!(reason, close_reasons::SLOW_CONSUMER);

    // The pipeline is still live for remaining clients.
    run.change(5000, 1, order("tail", "NEW"));
    run.progress(5000);
    let (_, ts, upserts, _) = fast
        .next_delta(Duration::from_secs(5))
        .await
        .expect("tail delta");
    assert_eq!(ts, 5000);
    assert_eq!(upserts[0].key, "tail");

    let metrics = reqwest::get(format!("http://{}/metrics", stack.health_addr))
        .await
        .expect("metrics request")
        .text()
        .await
        .expect("metrics body");
    assert!(
        metrics.contains("relay_slow_consumer_kills_total 1"),
        "metrics were: {metrics}"
    );

    let _ = stack.shutdown_tx.send(true);
    let _ = stack.handle.await;
}

#[tokio::test]
async fn shutdown_says_bye_and_closes_going_away() {
    let stack = start_stack(64, Duration::from_secs(15)).await;
    let run = stack.upstream.push_run("orders");
    run.progress(1);

    let mut probe = probe_with_snapshot(stack.ws_addr, &[]).await;
    let _ = stack.shutdown_tx.send(true);

    match probe.next_frame(Duration::from_secs(5)).await {
        Ok(SyncFrame::Bye { reason }) => assert_eq!(reason, "shutdown"),
        other => panic!("expected bye, got {other:?}"),
    }
    let (code, _) = probe
        .expect_close(Duration::from_secs(5))
        .await
        .expect("close after bye");
    assert_eq!(code, 1001);

    assert_eq!(
        stack.handle.await.expect("orchestrator should finish"),
        RunOutcome::Shutdown
    );
}
