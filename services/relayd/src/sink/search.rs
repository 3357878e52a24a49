//! Search-index sink.
//!
//! Applies consolidated batches to an HTTP bulk-NDJSON index endpoint.
//! Documents are keyed by row key, which makes every write idempotent and
//! hydration safe to repeat after a reconnect.
//!
//! # Failure semantics
//! - Per-item rejections: the failing sub-batch is retried once after 250 ms,
//!   then surviving failures are logged, counted, and dropped. The upstream
//!   is authoritative and the next hydration repairs drift.
//! - Transport and HTTP-level failures bubble up so the supervisor reconnects
//!   and rehydrates.

use crate::config::SearchConfig;
use crate::metrics::Metrics;
use crate::sink::shape::ShapeFn;
use crate::sink::SinkError;
use relay_core::event::{FlushBatch, NetOp};
use relay_core::schema::ViewSchema;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const PER_ITEM_RETRY_DELAY: Duration = Duration::from_millis(250);

/// One bulk line pair: the action line and, for upserts, the document line.
#[derive(Debug, Clone)]
struct BulkOp {
    key: String,
    action: String,
    doc: Option<String>,
}

impl BulkOp {
    fn upsert(index: &str, key: &str, doc: &serde_json::Value) -> Self {
        BulkOp {
            key: key.to_owned(),
            action: format!(r#"{{"index":{{"_index":{},"_id":{}}}}}"#, json_str(index), json_str(key)),
            doc: Some(doc.to_string()),
        }
    }

    fn delete(index: &str, key: &str) -> Self {
        BulkOp {
            key: key.to_owned(),
            action: format!(r#"{{"delete":{{"_index":{},"_id":{}}}}}"#, json_str(index), json_str(key)),
            doc: None,
        }
    }

    fn byte_len(&self) -> usize {
        self.action.len() + 1 + self.doc.as_ref().map(|d| d.len() + 1).unwrap_or(0)
    }
}

fn json_str(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

pub struct SearchSink {
    http: reqwest::Client,
    bulk_url: String,
    index_url: String,
    index: String,
    shape: ShapeFn,
    bulk_max_docs: usize,
    bulk_max_bytes: usize,
    hydration_window: usize,
    metrics: Arc<Metrics>,
    schema: Option<Arc<ViewSchema>>,
    /// Keys this sink believes exist in the index; used to delete documents
    /// whose keys vanish from the snapshot across a rehydration.
    live_keys: HashSet<String>,
    staged_keys: HashSet<String>,
    chunk: Vec<BulkOp>,
    chunk_bytes: usize,
    inflight: JoinSet<Result<usize, SinkError>>,
}

impl SearchSink {
    pub fn new(
        cfg: &SearchConfig,
        view: &str,
        shape: ShapeFn,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        let base = cfg.base_url.trim_end_matches('/');
        // Index naming follows the engine's convention: lowercase view name.
        let index = view.to_lowercase();
        Ok(SearchSink {
            http,
            bulk_url: format!("{base}/_bulk"),
            index_url: format!("{base}/{index}"),
            index,
            shape,
            bulk_max_docs: cfg.bulk_max_docs.max(1),
            bulk_max_bytes: cfg.bulk_max_bytes.max(1),
            hydration_window: cfg.hydration_window.max(1),
            metrics,
            schema: None,
            live_keys: HashSet::new(),
            staged_keys: HashSet::new(),
            chunk: Vec::new(),
            chunk_bytes: 0,
            inflight: JoinSet::new(),
        })
    }

    pub async fn begin_hydration(&mut self, schema: Arc<ViewSchema>) -> Result<(), SinkError> {
        self.schema = Some(schema);
        self.ensure_index().await?;
        self.staged_keys.clear();
        self.chunk.clear();
        self.chunk_bytes = 0;
        // Abort any window left over from a failed hydration attempt.
        self.inflight = JoinSet::new();
        Ok(())
    }

    pub async fn hydrate_ops(&mut self, ops: Vec<NetOp>) -> Result<(), SinkError> {
        for op in ops {
            match &op {
                NetOp::Upsert { key, .. } => {
                    self.staged_keys.insert(key.clone());
                }
                NetOp::Delete { key } => {
                    self.staged_keys.remove(key);
                }
            }
            let bulk_op = self.to_bulk_op(&op)?;
            if self.chunk.len() >= self.bulk_max_docs
                || self.chunk_bytes + bulk_op.byte_len() > self.bulk_max_bytes
            {
                self.flush_chunk().await?;
            }
            self.chunk_bytes += bulk_op.byte_len();
            self.chunk.push(bulk_op);
        }
        Ok(())
    }

    pub async fn finish_hydration(&mut self, cutoff_ts: u64) -> Result<(), SinkError> {
        if !self.chunk.is_empty() {
            self.flush_chunk().await?;
        }
        while let Some(joined) = self.inflight.join_next().await {
            self.absorb_joined(Some(joined))?;
        }
        // Drift repair: documents whose keys vanished upstream since the last
        // hydration are still in the index and must go.
        let vanished: Vec<BulkOp> = self
            .live_keys
            .difference(&self.staged_keys)
            .map(|key| BulkOp::delete(&self.index, key))
            .collect();
        if !vanished.is_empty() {
            debug!(
                index = %self.index,
                count = vanished.len(),
                "deleting documents for vanished keys"
            );
            for chunk in self.chunks_of(vanished) {
                let rejected = send_bulk_with_retry(
                    self.http.clone(),
                    self.bulk_url.clone(),
                    chunk,
                )
                .await?;
                Metrics::add(&self.metrics.sink_items_rejected, rejected as u64);
            }
        }
        self.live_keys = std::mem::take(&mut self.staged_keys);
        info!(
            index = %self.index,
            documents = self.live_keys.len(),
            cutoff_ts,
            "hydration complete"
        );
        Ok(())
    }

    pub async fn apply_batch(&mut self, batch: FlushBatch) -> Result<(), SinkError> {
        let mut ops = Vec::with_capacity(batch.ops.len());
        for op in &batch.ops {
            match op {
                NetOp::Upsert { key, .. } => {
                    self.live_keys.insert(key.clone());
                }
                NetOp::Delete { key } => {
                    self.live_keys.remove(key);
                }
            }
            ops.push(self.to_bulk_op(op)?);
        }
        let total = ops.len();
        for chunk in self.chunks_of(ops) {
            let rejected =
                send_bulk_with_retry(self.http.clone(), self.bulk_url.clone(), chunk).await?;
            Metrics::add(&self.metrics.sink_items_rejected, rejected as u64);
        }
        debug!(index = %self.index, ts = batch.ts, ops = total, "bulk batch applied");
        Ok(())
    }

    pub async fn close(&mut self) {
        while let Some(joined) = self.inflight.join_next().await {
            if let Err(e) = joined.map_err(|e| SinkError::Transport(e.to_string())).and_then(|r| r.map(|_| ())) {
                debug!(error = %e, "in-flight bulk discarded at close");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn to_bulk_op(&self, op: &NetOp) -> Result<BulkOp, SinkError> {
        match op {
            NetOp::Upsert { key, row } => {
                let schema = self
                    .schema
                    .as_ref()
                    .ok_or_else(|| SinkError::Transport("sink used before hydration".to_owned()))?;
                let doc = (self.shape)(schema, row)?;
                Ok(BulkOp::upsert(&self.index, key, &doc))
            }
            NetOp::Delete { key } => Ok(BulkOp::delete(&self.index, key)),
        }
    }

    /// Queue the current chunk into the rolling hydration window, waiting for
    /// a slot when the window is full.
    async fn flush_chunk(&mut self) -> Result<(), SinkError> {
        let ops = std::mem::take(&mut self.chunk);
        self.chunk_bytes = 0;
        if ops.is_empty() {
            return Ok(());
        }
        while self.inflight.len() >= self.hydration_window {
            let joined = self.inflight.join_next().await;
            self.absorb_joined(joined)?;
        }
        let http = self.http.clone();
        let url = self.bulk_url.clone();
        self.inflight
            .spawn(async move { send_bulk_with_retry(http, url, ops).await });
        Ok(())
    }

    fn absorb_joined(
        &self,
        joined: Option<Result<Result<usize, SinkError>, tokio::task::JoinError>>,
    ) -> Result<(), SinkError> {
        match joined {
            None => Ok(()),
            Some(Err(join_error)) => Err(SinkError::Transport(join_error.to_string())),
            Some(Ok(Err(e))) => Err(e),
            Some(Ok(Ok(rejected))) => {
                Metrics::add(&self.metrics.sink_items_rejected, rejected as u64);
                Ok(())
            }
        }
    }

    fn chunks_of(&self, ops: Vec<BulkOp>) -> Vec<Vec<BulkOp>> {
        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut bytes = 0usize;
        for op in ops {
            if !current.is_empty()
                && (current.len() >= self.bulk_max_docs || bytes + op.byte_len() > self.bulk_max_bytes)
            {
                chunks.push(std::mem::take(&mut current));
                bytes = 0;
            }
            bytes += op.byte_len();
            current.push(op);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    async fn ensure_index(&self) -> Result<(), SinkError> {
        let body = serde_json::json!({"mappings": {"dynamic": true}});
        let response = self
            .http
            .put(&self.index_url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        let status = response.status();
        if status.is_success() {
            info!(index = %self.index, "index created");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() == 400 && text.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(SinkError::Transport(format!(
            "index create returned {status}: {text}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Bulk request plumbing (shared by the windowed and inline paths)
// ---------------------------------------------------------------------------

/// Send one bulk request; retry the rejected sub-batch once, then log and
/// drop what still fails. Returns the number of dropped items.
async fn send_bulk_with_retry(
    http: reqwest::Client,
    url: String,
    ops: Vec<BulkOp>,
) -> Result<usize, SinkError> {
    let failed = send_bulk(&http, &url, &ops).await?;
    if failed.is_empty() {
        return Ok(0);
    }
    tokio::time::sleep(PER_ITEM_RETRY_DELAY).await;
    let retry_ops: Vec<BulkOp> = ops
        .into_iter()
        .filter(|op| failed.contains(&op.key))
        .collect();
    let still_failed = send_bulk(&http, &url, &retry_ops).await?;
    for key in &still_failed {
        warn!(key = %key, "bulk item rejected after retry; dropping");
    }
    Ok(still_failed.len())
}

/// Returns the keys of per-item failures.
async fn send_bulk(
    http: &reqwest::Client,
    url: &str,
    ops: &[BulkOp],
) -> Result<HashSet<String>, SinkError> {
    let mut body = String::new();
    for op in ops {
        body.push_str(&op.action);
        body.push('\n');
        if let Some(doc) = &op.doc {
            body.push_str(doc);
            body.push('\n');
        }
    }
    let response = http
        .post(url)
        .header("content-type", "application/x-ndjson")
        .body(body)
        .send()
        .await
        .map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(SinkError::Transport(format!(
            "bulk returned {status}: {text}"
        )));
    }
    let parsed: serde_json::Value = response
        .json()
        .await
        .map_err(|e| SinkError::Transport(format!("bulk response parse: {e}")))?;
    let mut failed = HashSet::new();
    if parsed["errors"].as_bool() == Some(true) {
        if let Some(items) = parsed["items"].as_array() {
            for item in items {
                let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
                    continue;
                };
                // Absent documents on delete are fine; only explicit errors count.
                if result.get("error").is_some() {
                    if let Some(id) = result["_id"].as_str() {
                        failed.insert(id.to_owned());
                    }
                }
            }
        }
    }
    Ok(failed)
}

fn request_error(e: reqwest::Error) -> SinkError {
    if e.is_timeout() {
        SinkError::Timeout
    } else {
        SinkError::Transport(e.to_string())
    }
}
