//! A scripted upstream connector.
//!
//! Tests register views with a schema and a snapshot, then queue one or more
//! "runs" per view. Each `subscribe` call consumes the oldest queued run and
//! returns a stream the test feeds live through its [`RunHandle`]; dropping
//! the handle (or calling [`RunHandle::disconnect`]) ends the stream like a
//! connection loss. A `subscribe` with no queued run fails as unavailable,
//! which exercises the caller's backoff path.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use relay_core::connector::{SubscribeOptions, UpstreamConnector};
use relay_core::error::UpstreamError;
use relay_core::event::RawRow;
use relay_core::schema::ViewSchema;
use relay_core::value::{Row, Scalar};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type ScriptItem = Result<RawRow, UpstreamError>;

struct ViewScript {
    schema: Arc<ViewSchema>,
    snapshot: Vec<Row>,
    runs: VecDeque<mpsc::UnboundedReceiver<ScriptItem>>,
}

#[derive(Default)]
struct Inner {
    views: HashMap<String, ViewScript>,
    subscribe_calls: u64,
    snapshot_calls: u64,
}

#[derive(Clone, Default)]
pub struct ScriptedUpstream {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a view. Unregistered views fail with `ViewNotFound`.
    pub fn add_view(&self, schema: ViewSchema) {
        let mut inner = self.inner.lock().expect("scripted upstream poisoned");
        inner.views.insert(
            schema.view.clone(),
            ViewScript {
                schema: Arc::new(schema),
                snapshot: Vec::new(),
                runs: VecDeque::new(),
            },
        );
    }

    /// Replace the rows served by `snapshot` and by subscribe snapshot
    /// prefixes for this view.
    pub fn set_snapshot(&self, view: &str, rows: Vec<Row>) {
        let mut inner = self.inner.lock().expect("scripted upstream poisoned");
        let script = inner
            .views
            .get_mut(view)
            .unwrap_or_else(|| panic!("view {view:?} not registered"));
        script.snapshot = rows;
    }

    /// Queue one subscribe run and return the handle that feeds it.
    pub fn push_run(&self, view: &str) -> RunHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("scripted upstream poisoned");
        let script = inner
            .views
            .get_mut(view)
            .unwrap_or_else(|| panic!("view {view:?} not registered"));
        script.runs.push_back(rx);
        RunHandle {
            tx: Mutex::new(Some(tx)).into(),
        }
    }

    pub fn subscribe_calls(&self) -> u64 {
        self.inner.lock().expect("scripted upstream poisoned").subscribe_calls
    }

    pub fn snapshot_calls(&self) -> u64 {
        self.inner.lock().expect("scripted upstream poisoned").snapshot_calls
    }
}

impl UpstreamConnector for ScriptedUpstream {
    type SnapshotRows = BoxStream<'static, Result<(String, Row), UpstreamError>>;
    type ChangeRows = BoxStream<'static, Result<RawRow, UpstreamError>>;

    async fn snapshot(
        &self,
        view: &str,
        key_column: &str,
    ) -> Result<(Arc<ViewSchema>, Self::SnapshotRows), UpstreamError> {
        let mut inner = self.inner.lock().expect("scripted upstream poisoned");
        inner.snapshot_calls += 1;
        let script = inner
            .views
            .get(view)
            .ok_or_else(|| UpstreamError::ViewNotFound(view.to_owned()))?;
        let schema = script.schema.clone();
        let key_index = schema.column_index(key_column).ok_or_else(|| {
            UpstreamError::Malformed(format!("view {view:?} has no column {key_column:?}"))
        })?;
        let items: Vec<Result<(String, Row), UpstreamError>> = script
            .snapshot
            .iter()
            .map(|row| keyed(row, key_index, key_column))
            .collect();
        Ok((schema, futures_util::stream::iter(items).boxed()))
    }

    async fn subscribe(
        &self,
        view: &str,
        options: SubscribeOptions,
    ) -> Result<(Arc<ViewSchema>, Self::ChangeRows), UpstreamError> {
        let mut inner = self.inner.lock().expect("scripted upstream poisoned");
        inner.subscribe_calls += 1;
        let script = inner
            .views
            .get_mut(view)
            .ok_or_else(|| UpstreamError::ViewNotFound(view.to_owned()))?;
        let run = script
            .runs
            .pop_front()
            .ok_or_else(|| UpstreamError::Unavailable("no scripted run queued".to_owned()))?;
        let prefix: Vec<ScriptItem> = if options.emit_snapshot {
            script
                .snapshot
                .iter()
                .map(|row| Ok(RawRow::snapshot(row.0.clone())))
                .collect()
        } else {
            Vec::new()
        };
        let schema = script.schema.clone();
        let stream = futures_util::stream::iter(prefix)
            .chain(UnboundedReceiverStream::new(run))
            .boxed();
        Ok((schema, stream))
    }

    async fn close(&self) {}
}

fn keyed(
    row: &Row,
    key_index: usize,
    key_column: &str,
) -> Result<(String, Row), UpstreamError> {
    row.get(key_index)
        .and_then(Scalar::as_key_string)
        .map(|key| (key, row.clone()))
        .ok_or_else(|| {
            UpstreamError::Malformed(format!("snapshot row with unusable key in {key_column:?}"))
        })
}

/// Feeds one queued subscribe run.
#[derive(Clone)]
pub struct RunHandle {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<ScriptItem>>>>,
}

impl RunHandle {
    pub fn change(&self, ts: u64, diff: i64, values: Vec<Scalar>) {
        self.send(Ok(RawRow::change(ts, diff, values)));
    }

    pub fn progress(&self, ts: u64) {
        self.send(Ok(RawRow::progress(ts)));
    }

    pub fn snapshot_row(&self, values: Vec<Scalar>) {
        self.send(Ok(RawRow::snapshot(values)));
    }

    pub fn error(&self, error: UpstreamError) {
        self.send(Err(error));
    }

    /// End the run as a connection loss would: the stream terminates.
    pub fn disconnect(&self) {
        let _ = self
            .tx
            .lock()
            .expect("run handle poisoned")
            .take();
    }

    fn send(&self, item: ScriptItem) {
        let guard = self.tx.lock().expect("run handle poisoned");
        if let Some(tx) = guard.as_ref() {
            // A dropped stream (reconnecting consumer) is fine in tests.
            let _ = tx.send(item);
        }
    }
}
