//! The /sync WebSocket endpoint.
//!
//! Session flow: the client opens the socket and sends `hello` with the views
//! it wants; the server replies per view with chunked `snapshot` frames and a
//! `snapshot_end`, then streams `delta` frames. The server pings after the
//! configured idle interval and disconnects a client that does not pong
//! within the next interval. On shutdown every client gets `bye` and a 1001
//! close.
//!
//! A session never blocks the pipelines: its frames come from a bounded
//! queue, and the fan-out side kills the session if that queue overflows.

use crate::config::BroadcastConfig;
use crate::metrics::Metrics;
use crate::sink::broadcast::BroadcastHub;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use relay_protocol::{close_codes, close_reasons, SyncFrame};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct WsState {
    pub hub: BroadcastHub,
    pub cfg: Arc<BroadcastConfig>,
    pub shutdown: watch::Receiver<bool>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/sync", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_sync_socket(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &SyncFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_owned().into(),
        })))
        .await;
}

async fn handle_sync_socket(mut socket: WebSocket, state: WsState) {
    // First frame must be a hello naming at least one known view.
    let hello = tokio::time::timeout(state.cfg.ping_interval, socket.recv()).await;
    let views = match hello {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<SyncFrame>(&text) {
            Ok(SyncFrame::Hello { views }) if !views.is_empty() => views,
            _ => {
                close_with(
                    &mut socket,
                    close_codes::POLICY_VIOLATION,
                    close_reasons::BAD_HELLO,
                )
                .await;
                return;
            }
        },
        _ => {
            close_with(
                &mut socket,
                close_codes::POLICY_VIOLATION,
                close_reasons::BAD_HELLO,
            )
            .await;
            return;
        }
    };
    for view in &views {
        if !state.hub.has_view(view).await {
            debug!(view = %view, "hello for unserved view");
            close_with(
                &mut socket,
                close_codes::POLICY_VIOLATION,
                close_reasons::UNKNOWN_VIEW,
            )
            .await;
            return;
        }
    }

    let client_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<SyncFrame>(state.cfg.client_queue_capacity);
    let (kill_tx, mut kill_rx) = watch::channel::<Option<&'static str>>(None);
    let kill_tx = Arc::new(kill_tx);
    for view in &views {
        // Views were validated above; a racing deregistration just closes.
        if state
            .hub
            .subscribe(view, client_id, tx.clone(), kill_tx.clone())
            .await
            .is_err()
        {
            close_with(
                &mut socket,
                close_codes::POLICY_VIOLATION,
                close_reasons::UNKNOWN_VIEW,
            )
            .await;
            return;
        }
    }
    drop(tx);

    info!(client = %client_id, views = views.len(), "sync client connected");
    Metrics::incr(&state.metrics.clients_connected);

    let mut shutdown = state.shutdown.clone();
    let mut ping = tokio::time::interval(state.cfg.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // immediate first tick
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = send_frame(&mut socket, &SyncFrame::Bye {
                        reason: "shutdown".to_owned(),
                    })
                    .await;
                    close_with(&mut socket, close_codes::GOING_AWAY, "shutdown").await;
                    break;
                }
            }
            _ = kill_rx.changed() => {
                let reason = (*kill_rx.borrow()).unwrap_or(close_reasons::SLOW_CONSUMER);
                close_with(&mut socket, close_codes::POLICY_VIOLATION, reason).await;
                break;
            }
            queued = rx.recv() => {
                match queued {
                    Some(frame) => {
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                        ping.reset();
                    }
                    None => {
                        // All producers gone without a kill: server-side error.
                        let reason = *kill_rx.borrow();
                        match reason {
                            Some(reason) => {
                                close_with(&mut socket, close_codes::POLICY_VIOLATION, reason).await;
                            }
                            None => {
                                close_with(&mut socket, close_codes::INTERNAL_ERROR, "").await;
                            }
                        }
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    debug!(client = %client_id, "pong deadline missed; disconnecting");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                if !send_frame(&mut socket, &SyncFrame::Ping).await {
                    break;
                }
                awaiting_pong = true;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SyncFrame>(&text) {
                            Ok(SyncFrame::Pong) => awaiting_pong = false,
                            _ => {
                                close_with(
                                    &mut socket,
                                    close_codes::POLICY_VIOLATION,
                                    close_reasons::BAD_FRAME,
                                )
                                .await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client = %client_id, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unsubscribe(client_id).await;
    Metrics::decr(&state.metrics.clients_connected);
    info!(client = %client_id, "sync client disconnected");
}
