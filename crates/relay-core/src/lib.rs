// relay-core: Value model, change-stream decoding, and batch consolidation
// for the view synchronization pipelines.
//
// Everything in this crate is sink-agnostic: the connector contract yields raw
// rows, the decoder classifies them, and the consolidator folds them into
// net-operation batches at progress boundaries. Sink adapters live in the
// daemon crate.

pub mod backoff;
pub mod connector;
pub mod consolidate;
pub mod decode;
pub mod error;
pub mod event;
pub mod schema;
pub mod value;

pub use connector::{SubscribeOptions, UpstreamConnector};
pub use consolidate::Consolidator;
pub use decode::Decoder;
pub use error::{ProtocolError, UpstreamError, ValueError};
pub use event::{FlushBatch, NetOp, RawRow, ViewEvent};
pub use schema::{Column, ColumnKind, ViewSchema};
pub use value::{Row, Scalar};
