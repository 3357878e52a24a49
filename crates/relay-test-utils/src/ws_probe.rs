//! A WebSocket probe client for the /sync endpoint.
//!
//! Wraps a raw client socket with frame-level helpers. Transport pings are
//! answered automatically; application `ping` frames are answered with
//! `pong` unless the test disables that to provoke a liveness disconnect.

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{DeltaUpsert, SyncFrame};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

#[derive(Debug)]
pub enum ProbeError {
    Timeout,
    Closed { code: u16, reason: String },
    Protocol(String),
    Ws(String),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Timeout => write!(f, "timed out waiting for a frame"),
            ProbeError::Closed { code, reason } => {
                write!(f, "connection closed ({code}: {reason})")
            }
            ProbeError::Protocol(s) => write!(f, "protocol: {s}"),
            ProbeError::Ws(s) => write!(f, "websocket: {s}"),
        }
    }
}

impl std::error::Error for ProbeError {}

pub struct WsProbe {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Answer application pings automatically (default true).
    pub auto_pong: bool,
}

impl WsProbe {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ProbeError> {
        let (ws, _response) = connect_async(format!("ws://{addr}/sync"))
            .await
            .map_err(|e| ProbeError::Ws(e.to_string()))?;
        Ok(WsProbe { ws, auto_pong: true })
    }

    /// Connect and subscribe in one step.
    pub async fn connect_and_hello(
        addr: SocketAddr,
        views: &[&str],
    ) -> Result<Self, ProbeError> {
        let mut probe = Self::connect(addr).await?;
        probe.hello(views).await?;
        Ok(probe)
    }

    pub async fn hello(&mut self, views: &[&str]) -> Result<(), ProbeError> {
        self.send_frame(&SyncFrame::Hello {
            views: views.iter().map(|v| (*v).to_owned()).collect(),
        })
        .await
    }

    pub async fn send_frame(&mut self, frame: &SyncFrame) -> Result<(), ProbeError> {
        let json = serde_json::to_string(frame).map_err(|e| ProbeError::Protocol(e.to_string()))?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ProbeError::Ws(e.to_string()))
    }

    /// Send a raw text payload, bypassing frame serialization.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ProbeError> {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .map_err(|e| ProbeError::Ws(e.to_string()))
    }

    /// Next application frame, answering transport and (optionally) app pings.
    pub async fn next_frame(&mut self, timeout: Duration) -> Result<SyncFrame, ProbeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let message = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .map_err(|_| ProbeError::Timeout)?;
            match message {
                None => {
                    return Err(ProbeError::Closed {
                        code: 1006,
                        reason: "eof".to_owned(),
                    });
                }
                Some(Err(e)) => return Err(ProbeError::Ws(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    let frame: SyncFrame = serde_json::from_str(&text)
                        .map_err(|e| ProbeError::Protocol(format!("bad frame JSON: {e}")))?;
                    if matches!(frame, SyncFrame::Ping) && self.auto_pong {
                        self.send_frame(&SyncFrame::Pong).await?;
                        continue;
                    }
                    return Ok(frame);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Err(ProbeError::Closed { code, reason });
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// Collect one full snapshot for `view`: every chunk up to `snapshot_end`.
    pub async fn collect_snapshot(
        &mut self,
        view: &str,
        timeout: Duration,
    ) -> Result<BTreeMap<String, serde_json::Value>, ProbeError> {
        let mut rows = BTreeMap::new();
        loop {
            match self.next_frame(timeout).await? {
                SyncFrame::Snapshot { view: v, rows: chunk } if v == view => {
                    for row in chunk {
                        rows.insert(row.key, row.row);
                    }
                }
                SyncFrame::SnapshotEnd { view: v } if v == view => return Ok(rows),
                other => {
                    return Err(ProbeError::Protocol(format!(
                        "unexpected frame during snapshot: {other:?}"
                    )));
                }
            }
        }
    }

    /// Next delta frame for any view.
    pub async fn next_delta(
        &mut self,
        timeout: Duration,
    ) -> Result<(String, u64, Vec<DeltaUpsert>, Vec<String>), ProbeError> {
        loop {
            match self.next_frame(timeout).await? {
                SyncFrame::Delta {
                    view,
                    upserts,
                    deletes,
                    ts,
                } => return Ok((view, ts, upserts, deletes)),
                SyncFrame::Bye { reason } => {
                    return Err(ProbeError::Protocol(format!("bye: {reason}")));
                }
                _ => {}
            }
        }
    }

    /// Drain frames until the server closes, returning code and reason.
    pub async fn expect_close(&mut self, timeout: Duration) -> Result<(u16, String), ProbeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            match self.next_frame(remaining).await {
                Ok(_) => continue,
                Err(ProbeError::Closed { code, reason }) => return Ok((code, reason)),
                Err(e) => return Err(e),
            }
        }
    }
}
