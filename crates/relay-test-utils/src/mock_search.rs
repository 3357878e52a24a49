//! A mock search endpoint for integration testing.
//!
//! Implements the slice of the HTTP contract the sink uses: index create
//! (`PUT /{index}`) and bulk NDJSON (`POST /_bulk`). State is inspectable,
//! and tests can inject per-key rejections or whole-request failures.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{post, put};
use axum::{Json, Router};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Default)]
pub struct MockSearchState {
    pub indices: HashMap<String, BTreeMap<String, serde_json::Value>>,
    pub created_indices: Vec<String>,
    pub bulk_requests: u64,
    /// Document ids whose index operations fail per-item.
    pub reject_keys: HashSet<String>,
    /// Whole-request failures to serve before behaving again.
    pub fail_transport_remaining: u32,
}

type Shared = Arc<Mutex<MockSearchState>>;

pub struct MockSearch {
    addr: SocketAddr,
    state: Shared,
    _task: tokio::task::JoinHandle<()>,
}

impl MockSearch {
    /// Start on a random local port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let state: Shared = Arc::default();
        let router = Router::new()
            .route("/_bulk", post(bulk))
            .route("/{index}", put(create_index))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(MockSearch {
            addr,
            state,
            _task: task,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn docs(&self, index: &str) -> BTreeMap<String, serde_json::Value> {
        self.lock().indices.get(index).cloned().unwrap_or_default()
    }

    pub fn created(&self, index: &str) -> bool {
        self.lock().created_indices.iter().any(|i| i == index)
    }

    pub fn bulk_requests(&self) -> u64 {
        self.lock().bulk_requests
    }

    /// Make index operations for `key` fail per-item until cleared.
    pub fn reject_key(&self, key: &str) {
        self.lock().reject_keys.insert(key.to_owned());
    }

    pub fn clear_rejections(&self) {
        self.lock().reject_keys.clear();
    }

    /// Fail the next `n` bulk requests wholesale with a 503.
    pub fn fail_next_bulks(&self, n: u32) {
        self.lock().fail_transport_remaining = n;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockSearchState> {
        self.state.lock().expect("mock search poisoned")
    }
}

async fn create_index(
    State(state): State<Shared>,
    Path(index): Path<String>,
) -> impl IntoResponse {
    let mut state = state.lock().expect("mock search poisoned");
    if state.indices.contains_key(&index) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": {"type": "resource_already_exists_exception"},
                "status": 400,
            })),
        );
    }
    state.indices.insert(index.clone(), BTreeMap::new());
    state.created_indices.push(index.clone());
    (
        StatusCode::OK,
        Json(serde_json::json!({"acknowledged": true, "index": index})),
    )
}

async fn bulk(State(state): State<Shared>, body: String) -> impl IntoResponse {
    let mut state = state.lock().expect("mock search poisoned");
    if state.fail_transport_remaining > 0 {
        state.fail_transport_remaining -= 1;
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "injected transport failure"})),
        );
    }
    state.bulk_requests += 1;

    let mut items = Vec::new();
    let mut errors = false;
    let mut lines = body.lines().filter(|l| !l.is_empty());
    while let Some(action_line) = lines.next() {
        let action: serde_json::Value = match serde_json::from_str(action_line) {
            Ok(v) => v,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "malformed action line"})),
                );
            }
        };
        if let Some(op) = action.get("index") {
            let index = op["_index"].as_str().unwrap_or_default().to_owned();
            let id = op["_id"].as_str().unwrap_or_default().to_owned();
            let doc_line = lines.next().unwrap_or("{}");
            let doc: serde_json::Value =
                serde_json::from_str(doc_line).unwrap_or(serde_json::Value::Null);
            if state.reject_keys.contains(&id) {
                errors = true;
                items.push(serde_json::json!({
                    "index": {
                        "_index": index,
                        "_id": id,
                        "status": 400,
                        "error": {"type": "document_rejected"},
                    }
                }));
            } else {
                state.indices.entry(index.clone()).or_default().insert(id.clone(), doc);
                items.push(serde_json::json!({
                    "index": {"_index": index, "_id": id, "status": 201}
                }));
            }
        } else if let Some(op) = action.get("delete") {
            let index = op["_index"].as_str().unwrap_or_default().to_owned();
            let id = op["_id"].as_str().unwrap_or_default().to_owned();
            let existed = state
                .indices
                .entry(index.clone())
                .or_default()
                .remove(&id)
                .is_some();
            items.push(serde_json::json!({
                "delete": {
                    "_index": index,
                    "_id": id,
                    "status": if existed { 200 } else { 404 },
                }
            }));
        } else {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "unsupported bulk action"})),
            );
        }
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({"took": 1, "errors": errors, "items": items})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bulk_applies_index_and_delete_operations() {
        let mock = MockSearch::start().await.expect("start mock");
        let response = post_bulk(
            &mock.url(),
            concat!(
                r#"{"index":{"_index":"orders","_id":"o1"}}"#,
                "\n",
                r#"{"status":"NEW"}"#,
                "\n",
                r#"{"delete":{"_index":"orders","_id":"gone"}}"#,
                "\n",
            ),
        )
        .await;
        assert!(response["errors"].as_bool() == Some(false));
        assert_eq!(mock.docs("orders")["o1"], serde_json::json!({"status": "NEW"}));
    }

    #[tokio::test]
    async fn rejected_keys_produce_per_item_errors() {
        let mock = MockSearch::start().await.expect("start mock");
        mock.reject_key("bad");
        let response = post_bulk(
            &mock.url(),
            concat!(
                r#"{"index":{"_index":"orders","_id":"good"}}"#,
                "\n",
                r#"{"v":1}"#,
                "\n",
                r#"{"index":{"_index":"orders","_id":"bad"}}"#,
                "\n",
                r#"{"v":2}"#,
                "\n",
            ),
        )
        .await;
        assert_eq!(response["errors"].as_bool(), Some(true));
        let docs = mock.docs("orders");
        assert!(docs.contains_key("good"));
        assert!(!docs.contains_key("bad"));
    }

    async fn post_bulk(base: &str, body: &str) -> serde_json::Value {
        reqwest::Client::new()
            .post(format!("{base}/_bulk"))
            .header("content-type", "application/x-ndjson")
            .body(body.to_owned())
            .send()
            .await
            .expect("bulk request")
            .json()
            .await
            .expect("bulk response body")
    }
}
