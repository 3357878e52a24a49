//! Process configuration.
//!
//! Environment variables select endpoints and tuning; the pipeline table
//! comes from a TOML descriptor file named by `PIPELINE_DESCRIPTORS`.
//!
//! # Required
//! - `UPSTREAM_URL` — connection URL for the upstream engine (credentials
//!   included, standard relational URL form).
//! - `PIPELINE_DESCRIPTORS` — path to the descriptor TOML.
//!
//! # Descriptor file format
//! ```toml
//! schema_version = 1
//!
//! [[pipelines]]
//! view = "orders"
//! sink = "search"          # "search" | "broadcast"
//! key_column = "order_id"
//! shape = "identity"       # optional, defaults to "identity"
//! ```

use relay_core::backoff::BackoffPolicy;
use relay_core::consolidate::DEFAULT_MAX_PENDING_KEYS;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub upstream: UpstreamConfig,
    pub search: SearchConfig,
    pub broadcast: BroadcastConfig,
    pub retry: BackoffPolicy,
    /// Keys buffered per progress window before a pipeline pauses its
    /// upstream reads.
    pub max_pending_keys: usize,
    pub health_listen_addr: String,
    pub descriptors: Vec<PipelineDescriptor>,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    /// Logical query-path name set on every session before subscribing.
    pub cluster: String,
    pub hydration: HydrationMode,
    pub connect_timeout: Duration,
}

/// How a pipeline obtains its initial sink state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationMode {
    /// Hydrate from the snapshot prefix of the subscribe stream itself.
    /// Snapshot and live phase share one consistent timeline.
    Subscribe,
    /// Run a standalone snapshot read, then subscribe without snapshot rows.
    Separate,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub base_url: String,
    pub bulk_max_docs: usize,
    pub bulk_max_bytes: usize,
    /// In-flight bulk requests during hydration.
    pub hydration_window: usize,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub listen_addr: String,
    pub client_queue_capacity: usize,
    pub ping_interval: Duration,
    /// Rows per `snapshot` frame chunk.
    pub snapshot_chunk_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Search,
    Broadcast,
}

impl SinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SinkKind::Search => "search",
            SinkKind::Broadcast => "broadcast",
        }
    }
}

/// One (view, sink) pipeline to run.
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub view: String,
    pub sink: SinkKind,
    pub key_column: String,
    pub shape: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },
    #[error("reading descriptor file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing descriptor file: {0}")]
    Parse(String),
    #[error("invalid pipeline descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("unknown shape id {0:?}")]
    UnknownShape(String),
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawDescriptorFile {
    schema_version: Option<u32>,
    pipelines: Option<Vec<RawPipeline>>,
}

#[derive(Debug, Deserialize)]
struct RawPipeline {
    view: Option<String>,
    sink: Option<String>,
    key_column: Option<String>,
    shape: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl RelayConfig {
    /// Load from the process environment and the descriptor file it names.
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookup = |name: &str| std::env::var(name).ok();
        let descriptor_path = lookup("PIPELINE_DESCRIPTORS")
            .ok_or(ConfigError::MissingVar("PIPELINE_DESCRIPTORS"))?;
        let toml_str =
            std::fs::read_to_string(Path::new(&descriptor_path)).map_err(|e| ConfigError::Io {
                path: descriptor_path.clone(),
                source: e,
            })?;
        Self::from_lookup(&lookup, &toml_str)
    }

    /// Build from an arbitrary variable lookup and descriptor TOML text.
    /// Tests use this to avoid touching the process environment.
    pub fn from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
        descriptors_toml: &str,
    ) -> Result<Self, ConfigError> {
        let upstream = UpstreamConfig {
            url: lookup("UPSTREAM_URL").ok_or(ConfigError::MissingVar("UPSTREAM_URL"))?,
            cluster: lookup("UPSTREAM_CLUSTER").unwrap_or_else(|| "serving".to_owned()),
            hydration: match lookup("UPSTREAM_HYDRATION").as_deref() {
                None | Some("subscribe") => HydrationMode::Subscribe,
                Some("separate") => HydrationMode::Separate,
                Some(other) => {
                    return Err(ConfigError::InvalidVar {
                        var: "UPSTREAM_HYDRATION",
                        reason: format!("expected 'subscribe' or 'separate', got {other:?}"),
                    });
                }
            },
            connect_timeout: Duration::from_secs(10),
        };

        let search = SearchConfig {
            base_url: lookup("SINK_SEARCH_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9200".to_owned()),
            bulk_max_docs: parse_var(lookup, "SINK_SEARCH_BULK_MAX_DOCS", 500)?,
            bulk_max_bytes: parse_var(lookup, "SINK_SEARCH_BULK_MAX_BYTES", 4 * 1024 * 1024)?,
            hydration_window: 4,
            request_timeout: Duration::from_secs(30),
        };

        let broadcast = BroadcastConfig {
            listen_addr: lookup("BROADCAST_LISTEN_ADDR")
                .unwrap_or_else(|| "0.0.0.0:7171".to_owned()),
            client_queue_capacity: parse_var(lookup, "BROADCAST_CLIENT_QUEUE_CAPACITY", 1024)?,
            ping_interval: Duration::from_secs(parse_var(
                lookup,
                "BROADCAST_PING_INTERVAL_SEC",
                15,
            )?),
            snapshot_chunk_rows: 500,
        };

        let retry = BackoffPolicy {
            initial: Duration::from_millis(parse_var(lookup, "RETRY_INITIAL_DELAY_MS", 1000)?),
            max: Duration::from_millis(parse_var(lookup, "RETRY_MAX_DELAY_MS", 30_000)?),
            multiplier: parse_var(lookup, "RETRY_BACKOFF_MULTIPLIER", 2.0)?,
        };
        if retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidVar {
                var: "RETRY_BACKOFF_MULTIPLIER",
                reason: "must be >= 1.0".to_owned(),
            });
        }

        Ok(RelayConfig {
            upstream,
            search,
            broadcast,
            retry,
            max_pending_keys: parse_var(lookup, "MAX_PENDING_KEYS", DEFAULT_MAX_PENDING_KEYS)?,
            health_listen_addr: lookup("HEALTH_LISTEN_ADDR")
                .unwrap_or_else(|| "0.0.0.0:7172".to_owned()),
            descriptors: parse_descriptors(descriptors_toml)?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            var,
            reason: e.to_string(),
        }),
    }
}

/// Parse and validate the descriptor TOML.
pub fn parse_descriptors(toml_str: &str) -> Result<Vec<PipelineDescriptor>, ConfigError> {
    let raw: RawDescriptorFile =
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::InvalidDescriptor("schema_version is required".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidDescriptor(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_pipelines = raw
        .pipelines
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConfigError::InvalidDescriptor("at least one [[pipelines]] entry is required".to_owned()))?;

    let mut descriptors = Vec::with_capacity(raw_pipelines.len());
    for (i, raw) in raw_pipelines.into_iter().enumerate() {
        let view = raw
            .view
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::InvalidDescriptor(format!("pipelines[{i}]: view is required")))?;
        let sink = match raw.sink.as_deref() {
            Some("search") => SinkKind::Search,
            Some("broadcast") => SinkKind::Broadcast,
            Some(other) => {
                return Err(ConfigError::InvalidDescriptor(format!(
                    "pipelines[{i}]: sink must be 'search' or 'broadcast', got {other:?}"
                )));
            }
            None => {
                return Err(ConfigError::InvalidDescriptor(format!(
                    "pipelines[{i}]: sink is required"
                )));
            }
        };
        let key_column = raw.key_column.filter(|k| !k.is_empty()).ok_or_else(|| {
            ConfigError::InvalidDescriptor(format!("pipelines[{i}]: key_column is required"))
        })?;
        let descriptor = PipelineDescriptor {
            view,
            sink,
            key_column,
            shape: raw.shape.unwrap_or_else(|| "identity".to_owned()),
        };
        if descriptors.iter().any(|d: &PipelineDescriptor| {
            d.view == descriptor.view && d.sink == descriptor.sink
        }) {
            return Err(ConfigError::InvalidDescriptor(format!(
                "duplicate pipeline for view {:?} and sink {:?}",
                descriptor.view,
                descriptor.sink.as_str()
            )));
        }
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}
