//! Broadcast sink: per-view in-memory state plus client fan-out.
//!
//! The hub owns one shared state per view: the latest `key → document` map,
//! the timestamp of the last applied batch, and the subscriber set. One lock
//! guards all three, so a subscriber registered while a batch is being
//! applied either sees the batch in its snapshot or receives it as a delta,
//! never both and never neither.
//!
//! Fan-out never blocks the pipeline: enqueueing to a client is a try-send
//! into its bounded queue, and a full queue terminates that session alone.

use crate::config::BroadcastConfig;
use crate::metrics::Metrics;
use crate::sink::shape::ShapeFn;
use crate::sink::SinkError;
use relay_core::event::{FlushBatch, NetOp};
use relay_core::schema::ViewSchema;
use relay_protocol::{close_reasons, DeltaUpsert, SnapshotRow, SyncFrame};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A kill switch shared by all of one client's subscriptions.
pub type KillSender = Arc<watch::Sender<Option<&'static str>>>;

struct Subscriber {
    tx: mpsc::Sender<SyncFrame>,
    kill: KillSender,
    /// Deltas at or below this timestamp are already in the client's snapshot.
    snapshot_ts: u64,
}

#[derive(Default)]
struct ViewState {
    rows: HashMap<String, serde_json::Value>,
    last_applied_ts: u64,
    subscribers: HashMap<Uuid, Subscriber>,
}

struct HubInner {
    views: RwLock<HashMap<String, Arc<RwLock<ViewState>>>>,
    snapshot_chunk_rows: usize,
    metrics: Arc<Metrics>,
}

/// Shared registry of per-view broadcast state. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(cfg: &BroadcastConfig, metrics: Arc<Metrics>) -> Self {
        BroadcastHub {
            inner: Arc::new(HubInner {
                views: RwLock::new(HashMap::new()),
                snapshot_chunk_rows: cfg.snapshot_chunk_rows.max(1),
                metrics,
            }),
        }
    }

    /// Make `view` subscribable. Idempotent; called once per broadcast
    /// pipeline at startup so clients can connect before first hydration.
    pub async fn register_view(&self, view: &str) {
        self.inner
            .views
            .write()
            .await
            .entry(view.to_owned())
            .or_default();
    }

    pub async fn has_view(&self, view: &str) -> bool {
        self.inner.views.read().await.contains_key(view)
    }

    /// Subscribe one client to `view`: enqueue the current contents as
    /// chunked snapshot frames and register for subsequent deltas.
    ///
    /// The snapshot and the cutoff timestamp are captured under the same
    /// write lock that batch application takes.
    pub async fn subscribe(
        &self,
        view: &str,
        client_id: Uuid,
        tx: mpsc::Sender<SyncFrame>,
        kill: KillSender,
    ) -> Result<(), UnknownView> {
        let shared = self
            .view_state(view)
            .await
            .ok_or_else(|| UnknownView(view.to_owned()))?;
        let mut state = shared.write().await;

        let mut rows = Vec::with_capacity(self.inner.snapshot_chunk_rows);
        let mut enqueue_failed = false;
        let mut enqueue = |frame: SyncFrame| {
            if !enqueue_failed && tx.try_send(frame).is_err() {
                enqueue_failed = true;
            }
        };
        for (key, row) in &state.rows {
            rows.push(SnapshotRow {
                key: key.clone(),
                row: row.clone(),
            });
            if rows.len() == self.inner.snapshot_chunk_rows {
                enqueue(SyncFrame::Snapshot {
                    view: view.to_owned(),
                    rows: std::mem::take(&mut rows),
                });
            }
        }
        enqueue(SyncFrame::Snapshot {
            view: view.to_owned(),
            rows,
        });
        enqueue(SyncFrame::SnapshotEnd {
            view: view.to_owned(),
        });
        if enqueue_failed {
            // The snapshot alone overflowed the client queue.
            let _ = kill.send(Some(close_reasons::SLOW_CONSUMER));
            Metrics::incr(&self.inner.metrics.slow_consumer_kills);
            return Ok(());
        }

        let snapshot_ts = state.last_applied_ts;
        state.subscribers.insert(
            client_id,
            Subscriber {
                tx,
                kill,
                snapshot_ts,
            },
        );
        debug!(view = %view, client = %client_id, snapshot_ts, "client subscribed");
        Ok(())
    }

    /// Remove every subscription held by `client_id`.
    pub async fn unsubscribe(&self, client_id: Uuid) {
        let views = self.inner.views.read().await;
        for shared in views.values() {
            shared.write().await.subscribers.remove(&client_id);
        }
    }

    /// Apply one batch: update the state map and fan the delta out.
    pub async fn apply_batch(
        &self,
        view: &str,
        upserts: Vec<(String, serde_json::Value)>,
        deletes: Vec<String>,
        ts: u64,
    ) -> Result<(), SinkError> {
        let shared = self
            .view_state(view)
            .await
            .ok_or_else(|| SinkError::Transport(format!("view {view:?} not registered")))?;
        let mut state = shared.write().await;
        for (key, row) in &upserts {
            state.rows.insert(key.clone(), row.clone());
        }
        for key in &deletes {
            state.rows.remove(key);
        }
        state.last_applied_ts = ts;
        let frame = SyncFrame::Delta {
            view: view.to_owned(),
            upserts: upserts
                .into_iter()
                .map(|(key, row)| DeltaUpsert { key, row })
                .collect(),
            deletes,
            ts,
        };
        self.fanout(&mut state, frame, ts);
        Ok(())
    }

    /// Install a freshly hydrated state map, fanning the difference from the
    /// previous map out as a single delta so connected clients converge
    /// without resubscribing.
    pub async fn install_hydrated(
        &self,
        view: &str,
        new_rows: HashMap<String, serde_json::Value>,
        cutoff_ts: u64,
    ) -> Result<(), SinkError> {
        let shared = self
            .view_state(view)
            .await
            .ok_or_else(|| SinkError::Transport(format!("view {view:?} not registered")))?;
        let mut state = shared.write().await;

        let mut upserts = Vec::new();
        for (key, row) in &new_rows {
            if state.rows.get(key) != Some(row) {
                upserts.push(DeltaUpsert {
                    key: key.clone(),
                    row: row.clone(),
                });
            }
        }
        let deletes: Vec<String> = state
            .rows
            .keys()
            .filter(|key| !new_rows.contains_key(*key))
            .cloned()
            .collect();

        state.rows = new_rows;
        state.last_applied_ts = state.last_applied_ts.max(cutoff_ts);
        info!(
            view = %view,
            rows = state.rows.len(),
            cutoff_ts,
            "hydrated state installed"
        );
        if !upserts.is_empty() || !deletes.is_empty() {
            let frame = SyncFrame::Delta {
                view: view.to_owned(),
                upserts,
                deletes,
                ts: cutoff_ts,
            };
            self.fanout(&mut state, frame, cutoff_ts);
        }
        Ok(())
    }

    /// Current contents of a view's state map. Test and probe support.
    pub async fn view_rows(&self, view: &str) -> Option<HashMap<String, serde_json::Value>> {
        let shared = self.view_state(view).await?;
        let state = shared.read().await;
        Some(state.rows.clone())
    }

    async fn view_state(&self, view: &str) -> Option<Arc<RwLock<ViewState>>> {
        self.inner.views.read().await.get(view).cloned()
    }

    /// Try-enqueue `frame` to every subscriber past its snapshot cutoff.
    /// Callers hold the view write lock, so this must not await.
    fn fanout(&self, state: &mut ViewState, frame: SyncFrame, ts: u64) {
        let metrics = &self.inner.metrics;
        state.subscribers.retain(|client_id, subscriber| {
            if ts <= subscriber.snapshot_ts {
                return true;
            }
            match subscriber.tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = %client_id, "client queue overflowed; terminating session");
                    let _ = subscriber.kill.send(Some(close_reasons::SLOW_CONSUMER));
                    Metrics::incr(&metrics.slow_consumer_kills);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown view: {0}")]
pub struct UnknownView(pub String);

// ---------------------------------------------------------------------------
// Pipeline-facing adapter
// ---------------------------------------------------------------------------

/// The sink adapter driven by one broadcast pipeline. Hydration builds a
/// staging map aside while the hub keeps serving the previous state; the
/// cutoff swaps them atomically.
pub struct BroadcastSink {
    hub: BroadcastHub,
    view: String,
    shape: ShapeFn,
    schema: Option<Arc<ViewSchema>>,
    staging: HashMap<String, serde_json::Value>,
}

impl BroadcastSink {
    pub fn new(hub: BroadcastHub, view: &str, shape: ShapeFn) -> Self {
        BroadcastSink {
            hub,
            view: view.to_owned(),
            shape,
            schema: None,
            staging: HashMap::new(),
        }
    }

    pub async fn begin_hydration(&mut self, schema: Arc<ViewSchema>) -> Result<(), SinkError> {
        self.schema = Some(schema);
        self.staging.clear();
        Ok(())
    }

    pub async fn hydrate_ops(&mut self, ops: Vec<NetOp>) -> Result<(), SinkError> {
        for op in ops {
            match op {
                NetOp::Upsert { key, row } => {
                    let doc = self.shape_row(&row)?;
                    self.staging.insert(key, doc);
                }
                NetOp::Delete { key } => {
                    self.staging.remove(&key);
                }
            }
        }
        Ok(())
    }

    pub async fn finish_hydration(&mut self, cutoff_ts: u64) -> Result<(), SinkError> {
        let rows = std::mem::take(&mut self.staging);
        self.hub.install_hydrated(&self.view, rows, cutoff_ts).await
    }

    pub async fn apply_batch(&mut self, batch: FlushBatch) -> Result<(), SinkError> {
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for op in batch.ops {
            match op {
                NetOp::Upsert { key, row } => upserts.push((key, self.shape_row(&row)?)),
                NetOp::Delete { key } => deletes.push(key),
            }
        }
        self.hub
            .apply_batch(&self.view, upserts, deletes, batch.ts)
            .await
    }

    pub async fn close(&mut self) {}

    fn shape_row(&self, row: &relay_core::value::Row) -> Result<serde_json::Value, SinkError> {
        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| SinkError::Transport("sink used before hydration".to_owned()))?;
        Ok((self.shape)(schema, row)?)
    }
}
