//! Wire-protocol upstream connector.
//!
//! Speaks the standard relational wire protocol to the streaming engine.
//! Each snapshot/subscribe call opens its own session, points it at the
//! serving cluster, captures the view schema from a prepared statement
//! description, and then streams rows over the simple-query protocol:
//!
//! ```sql
//! SET cluster = "<cluster>";
//! BEGIN;
//! DECLARE relay_sub CURSOR FOR SUBSCRIBE (SELECT * FROM <view>)
//!   WITH (PROGRESS, SNAPSHOT);
//! FETCH ALL relay_sub WITH (timeout = '1s');  -- repeated
//! ```
//!
//! Control columns: `mz_timestamp`, `mz_progressed`, `mz_diff`. Data columns
//! are matched by name against the captured schema and parsed from their text
//! form by column kind.

use crate::config::UpstreamConfig;
use async_stream::stream;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures_util::stream::BoxStream;
use relay_core::connector::{SubscribeOptions, UpstreamConnector};
use relay_core::error::UpstreamError;
use relay_core::event::RawRow;
use relay_core::schema::{Column, ColumnKind, ViewSchema};
use relay_core::value::{Row, Scalar};
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tracing::{debug, warn};

const TS_COLUMN: &str = "mz_timestamp";
const PROGRESS_COLUMN: &str = "mz_progressed";
const DIFF_COLUMN: &str = "mz_diff";

#[derive(Clone)]
pub struct PgUpstream {
    cfg: Arc<UpstreamConfig>,
}

impl PgUpstream {
    pub fn new(cfg: UpstreamConfig) -> Self {
        PgUpstream { cfg: Arc::new(cfg) }
    }

    /// Open a session and direct it at the low-latency serving cluster.
    async fn open_session(&self) -> Result<Client, UpstreamError> {
        let connect = tokio_postgres::connect(&self.cfg.url, NoTls);
        let (client, connection) = tokio::time::timeout(self.cfg.connect_timeout, connect)
            .await
            .map_err(|_| UpstreamError::Unavailable("connect timed out".to_owned()))?
            .map_err(connect_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "upstream connection task ended");
            }
        });
        client
            .batch_execute(&format!("SET cluster = {}", quote_ident(&self.cfg.cluster)))
            .await
            .map_err(|e| statement_error("cluster", e))?;
        Ok(client)
    }

    /// Capture column names and kinds from the statement description without
    /// executing the query.
    async fn capture_schema(
        client: &Client,
        view: &str,
    ) -> Result<Arc<ViewSchema>, UpstreamError> {
        let stmt = client
            .prepare(&format!("SELECT * FROM {}", quote_ident(view)))
            .await
            .map_err(|e| statement_error(view, e))?;
        let columns = stmt
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), column_kind(c.type_())))
            .collect();
        Ok(Arc::new(ViewSchema::new(view, columns)))
    }
}

impl UpstreamConnector for PgUpstream {
    type SnapshotRows = BoxStream<'static, Result<(String, Row), UpstreamError>>;
    type ChangeRows = BoxStream<'static, Result<RawRow, UpstreamError>>;

    async fn snapshot(
        &self,
        view: &str,
        key_column: &str,
    ) -> Result<(Arc<ViewSchema>, Self::SnapshotRows), UpstreamError> {
        let client = self.open_session().await?;
        let schema = Self::capture_schema(&client, view).await?;
        let key_index = schema.column_index(key_column).ok_or_else(|| {
            UpstreamError::Malformed(format!("view {view:?} has no column {key_column:?}"))
        })?;

        client
            .batch_execute(&format!(
                "BEGIN; DECLARE relay_snap CURSOR FOR SELECT * FROM {}",
                quote_ident(view)
            ))
            .await
            .map_err(|e| statement_error(view, e))?;

        let stream_schema = schema.clone();
        let key_column = key_column.to_owned();
        let rows = stream! {
            let mut layout: Option<Vec<usize>> = None;
            loop {
                let messages = match client.simple_query("FETCH 1000 FROM relay_snap").await {
                    Ok(messages) => messages,
                    Err(e) => {
                        yield Err(transport_error(e));
                        return;
                    }
                };
                let mut saw_row = false;
                for message in messages {
                    if let SimpleQueryMessage::Row(row) = message {
                        saw_row = true;
                        if layout.is_none() {
                            match data_layout(&stream_schema, &row, &[]) {
                                Ok(indices) => layout = Some(indices),
                                Err(e) => {
                                    yield Err(e);
                                    return;
                                }
                            }
                        }
                        let Some(indices) = layout.as_ref() else {
                            continue;
                        };
                        match parse_payload(&stream_schema, indices, &row) {
                            Ok(payload) => {
                                let row = Row(payload);
                                match row.get(key_index).and_then(Scalar::as_key_string) {
                                    Some(key) => yield Ok((key, row)),
                                    None => {
                                        yield Err(UpstreamError::Malformed(format!(
                                            "snapshot row with null or empty key in column {key_column:?}"
                                        )));
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }
                if !saw_row {
                    return;
                }
            }
        };
        Ok((schema, Box::pin(rows)))
    }

    async fn subscribe(
        &self,
        view: &str,
        options: SubscribeOptions,
    ) -> Result<(Arc<ViewSchema>, Self::ChangeRows), UpstreamError> {
        let client = self.open_session().await?;
        let schema = Self::capture_schema(&client, view).await?;

        let mut with = Vec::new();
        if options.with_progress {
            with.push("PROGRESS");
        }
        if options.emit_snapshot {
            with.push("SNAPSHOT");
        }
        let with_clause = if with.is_empty() {
            String::new()
        } else {
            format!(" WITH ({})", with.join(", "))
        };
        client
            .batch_execute(&format!(
                "BEGIN; DECLARE relay_sub CURSOR FOR SUBSCRIBE (SELECT * FROM {}){}",
                quote_ident(view),
                with_clause
            ))
            .await
            .map_err(|e| statement_error(view, e))?;

        let stream_schema = schema.clone();
        let rows = stream! {
            let mut layout: Option<SubscribeLayout> = None;
            loop {
                let messages = match client
                    .simple_query("FETCH ALL relay_sub WITH (timeout = '1s')")
                    .await
                {
                    Ok(messages) => messages,
                    Err(e) => {
                        yield Err(transport_error(e));
                        return;
                    }
                };
                for message in messages {
                    if let SimpleQueryMessage::Row(row) = message {
                        if layout.is_none() {
                            match SubscribeLayout::resolve(&stream_schema, &row) {
                                Ok(resolved) => layout = Some(resolved),
                                Err(e) => {
                                    yield Err(e);
                                    return;
                                }
                            }
                        }
                        let Some(layout) = layout.as_ref() else {
                            continue;
                        };
                        match layout.parse(&stream_schema, &row) {
                            Ok(raw) => yield Ok(raw),
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }
            }
        };
        Ok((schema, Box::pin(rows)))
    }

    async fn close(&self) {
        // Sessions are owned by the returned streams and close on drop.
    }
}

// ---------------------------------------------------------------------------
// Row layout and text parsing
// ---------------------------------------------------------------------------

/// Column positions of one subscribe result set, resolved on the first row.
struct SubscribeLayout {
    ts: usize,
    progressed: Option<usize>,
    diff: usize,
    data: Vec<usize>,
}

impl SubscribeLayout {
    fn resolve(schema: &ViewSchema, row: &SimpleQueryRow) -> Result<Self, UpstreamError> {
        let position = |name: &str| row.columns().iter().position(|c| c.name() == name);
        let ts = position(TS_COLUMN).ok_or_else(|| {
            UpstreamError::Malformed(format!("subscribe rows lack {TS_COLUMN:?}"))
        })?;
        let diff = position(DIFF_COLUMN).ok_or_else(|| {
            UpstreamError::Malformed(format!("subscribe rows lack {DIFF_COLUMN:?}"))
        })?;
        let data = data_layout(schema, row, &[TS_COLUMN, PROGRESS_COLUMN, DIFF_COLUMN])?;
        Ok(SubscribeLayout {
            ts,
            progressed: position(PROGRESS_COLUMN),
            diff,
            data,
        })
    }

    fn parse(&self, schema: &ViewSchema, row: &SimpleQueryRow) -> Result<RawRow, UpstreamError> {
        let progressed = match self.progressed {
            Some(index) => matches!(row.get(index), Some("t" | "true")),
            None => false,
        };
        if progressed {
            let ts = parse_upstream_ts(row.get(self.ts))?;
            return Ok(RawRow::progress(ts));
        }
        let diff = match row.get(self.diff) {
            None => None,
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                UpstreamError::Malformed(format!("unparseable {DIFF_COLUMN}: {raw:?}"))
            })?),
        };
        let ts = match row.get(self.ts) {
            None => None,
            Some(_) if diff.is_none() => None, // snapshot rows carry no committed ts
            some => Some(parse_upstream_ts(some)?),
        };
        let values = parse_payload(schema, &self.data, row)?;
        Ok(RawRow {
            ts,
            diff,
            progressed: false,
            values,
        })
    }
}

/// Positions of the schema's data columns inside a result row, by name.
fn data_layout(
    schema: &ViewSchema,
    row: &SimpleQueryRow,
    control: &[&str],
) -> Result<Vec<usize>, UpstreamError> {
    let mut indices = Vec::with_capacity(schema.columns.len());
    for column in &schema.columns {
        if control.contains(&column.name.as_str()) {
            continue;
        }
        let index = row
            .columns()
            .iter()
            .position(|c| c.name() == column.name)
            .ok_or_else(|| {
                UpstreamError::Malformed(format!(
                    "result set lacks schema column {:?}",
                    column.name
                ))
            })?;
        indices.push(index);
    }
    Ok(indices)
}

fn parse_payload(
    schema: &ViewSchema,
    indices: &[usize],
    row: &SimpleQueryRow,
) -> Result<Vec<Scalar>, UpstreamError> {
    let mut values = Vec::with_capacity(indices.len());
    for (column, &index) in schema.columns.iter().zip(indices.iter()) {
        values.push(parse_scalar(column.kind, row.get(index)).map_err(|reason| {
            UpstreamError::Malformed(format!("column {:?}: {reason}", column.name))
        })?);
    }
    Ok(values)
}

/// Parse one text-form value by its column kind.
fn parse_scalar(kind: ColumnKind, raw: Option<&str>) -> Result<Scalar, String> {
    let Some(raw) = raw else {
        return Ok(Scalar::Null);
    };
    match kind {
        ColumnKind::String => Ok(Scalar::String(raw.to_owned())),
        ColumnKind::Int => raw
            .parse::<i64>()
            .map(Scalar::Int)
            .map_err(|_| format!("not an integer: {raw:?}")),
        ColumnKind::Float => raw
            .parse::<f64>()
            .map(Scalar::Float)
            .map_err(|_| format!("not a float: {raw:?}")),
        ColumnKind::Bool => match raw {
            "t" | "true" => Ok(Scalar::Bool(true)),
            "f" | "false" => Ok(Scalar::Bool(false)),
            other => Err(format!("not a boolean: {other:?}")),
        },
        ColumnKind::Timestamp => parse_timestamp(raw)
            .map(Scalar::Timestamp)
            .ok_or_else(|| format!("not a timestamp: {raw:?}")),
        ColumnKind::Json => serde_json::from_str(raw)
            .map(Scalar::Json)
            .map_err(|e| format!("not valid JSON ({e}): {raw:?}")),
    }
}

/// Accept the text timestamp forms the wire protocol produces.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(with_offset) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(with_offset.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(rfc3339) = DateTime::parse_from_rfc3339(raw) {
        return Some(rfc3339.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

fn parse_upstream_ts(raw: Option<&str>) -> Result<u64, UpstreamError> {
    let raw = raw
        .ok_or_else(|| UpstreamError::Malformed(format!("{TS_COLUMN} is null")))?;
    if let Ok(ts) = raw.parse::<u64>() {
        return Ok(ts);
    }
    // Some engines render the timestamp with a decimal component.
    raw.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| f as u64)
        .ok_or_else(|| UpstreamError::Malformed(format!("unparseable {TS_COLUMN}: {raw:?}")))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn column_kind(ty: &Type) -> ColumnKind {
    if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 {
        ColumnKind::Int
    } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 || *ty == Type::NUMERIC {
        ColumnKind::Float
    } else if *ty == Type::BOOL {
        ColumnKind::Bool
    } else if *ty == Type::TIMESTAMP || *ty == Type::TIMESTAMPTZ || *ty == Type::DATE {
        ColumnKind::Timestamp
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        ColumnKind::Json
    } else {
        ColumnKind::String
    }
}

fn connect_error(e: tokio_postgres::Error) -> UpstreamError {
    if let Some(code) = e.code() {
        if *code == SqlState::INVALID_PASSWORD
            || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
        {
            return UpstreamError::Auth(e.to_string());
        }
    }
    UpstreamError::Unavailable(e.to_string())
}

fn statement_error(subject: &str, e: tokio_postgres::Error) -> UpstreamError {
    if let Some(code) = e.code() {
        if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::UNDEFINED_OBJECT {
            return UpstreamError::ViewNotFound(subject.to_owned());
        }
    }
    if e.is_closed() {
        return UpstreamError::Unavailable(e.to_string());
    }
    UpstreamError::Query(e.to_string())
}

fn transport_error(e: tokio_postgres::Error) -> UpstreamError {
    if e.is_closed() {
        UpstreamError::Unavailable(e.to_string())
    } else {
        warn!(error = %e, "subscribe fetch failed");
        UpstreamError::Query(e.to_string())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
