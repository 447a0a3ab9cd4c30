//! web-tunnel: a reverse HTTP tunnel.
//!
//! A publicly reachable [edge](../services/edge) accepts HTTP/1.1,
//! WebSocket, HTTP/2 and gRPC traffic and relays it over a single
//! long-lived control channel to an [agent](../services/agent) behind NAT,
//! which dispatches each request to a co-located origin server.
//!
//! This root crate exists to host the end-to-end integration suites under
//! `tests/integration/`; the implementation lives in the workspace members:
//!
//! - `crates/tunnel-protocol`: the frame codec spoken on the control channel
//! - `services/edge`: the public edge server
//! - `services/agent`: the private agent
//! - `crates/tunnel-test-utils`: mock origins for the test suites
