// relay-test-utils: Test doubles for the synchronization pipelines.
//
// - ScriptedUpstream: an in-process connector whose streams are driven by
//   the test, including mid-stream disconnects.
// - MockSearch: an HTTP endpoint that implements just enough of the bulk
//   NDJSON contract, with per-key rejection and transport fault injection.
// - WsProbe: a WebSocket client for the /sync endpoint with frame-level
//   helpers.

pub mod mock_search;
pub mod scripted_upstream;
pub mod ws_probe;

pub use mock_search::MockSearch;
pub use scripted_upstream::{RunHandle, ScriptedUpstream};
pub use ws_probe::{ProbeError, WsProbe};
