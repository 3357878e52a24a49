// view-relay: Workspace root.
//
// The root package exists to host the end-to-end integration suites under
// tests/integration/. The product code lives in crates/ and services/.
