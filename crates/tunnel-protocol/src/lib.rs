// tunnel-protocol: control-channel frame types and serialization.
//
// The control channel carries discrete JSON text frames, each naming an
// event plus positional argument fields.  Two on-wire event-name families
// exist (a plain one and an `http2-`-prefixed one) for interoperability
// with peers that keep separate HTTP/1 and HTTP/2 code paths; decoding
// accepts both and yields the single unified [`TunnelEvent`] enum, with the
// HTTP major version carried as [`Flavor`] on the request descriptor.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod headers;
mod wire;

pub use wire::{decode, encode, event_names};

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Which HTTP major version a tunneled request is carried as end-to-end.
///
/// `Http2` implies the frames may include trailers and the request body may
/// be interleaved after the response has started (full duplex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Http1,
    Http2,
}

/// An ordered header multimap.  Names are ASCII; values must not contain
/// NUL, CR or LF.  Order is preserved end-to-end.
pub type HeaderList = Vec<(String, String)>;

/// Sent once per tunneled request, before any body frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    /// URI reference including the query string, e.g. `/api/v1/x?y=1`.
    pub path: String,
    pub headers: HeaderList,
    pub flavor: Flavor,
}

/// Sent once per response, before (or together with) the first body frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseDescriptor {
    /// 100–599.
    pub status: u16,
    /// Reason phrase; empty is allowed (HTTP/2 has none).
    #[serde(default)]
    pub status_message: String,
    pub headers: HeaderList,
}

// ---------------------------------------------------------------------------
// Unified frame enum
// ---------------------------------------------------------------------------

/// One typed message on the control channel.
///
/// Every variant except `Ping`/`Pong` carries the 128-bit request id that
/// correlates frames on both ends.  Frames for one id are emitted and
/// delivered in order; there is no ordering across distinct ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// edge → agent: open a new tunneled request.
    Request { id: Uuid, descriptor: RequestDescriptor },
    /// edge → agent: request body chunk.
    RequestData { id: Uuid, data: Bytes },
    /// edge → agent: coalesced request body chunks, in order.
    RequestDataBatch { id: Uuid, chunks: Vec<Bytes> },
    /// edge → agent: half-close of the request body.
    RequestEnd { id: Uuid },
    /// edge → agent: abort the request.
    RequestError { id: Uuid, message: String },
    /// agent → edge: status + headers.
    Response { id: Uuid, descriptor: ResponseDescriptor },
    /// agent → edge: response body chunk.
    ResponseData { id: Uuid, data: Bytes },
    /// agent → edge: coalesced response body chunks, in order.
    ResponseDataBatch { id: Uuid, chunks: Vec<Bytes> },
    /// agent → edge: HTTP trailers; http2 flavor only, precedes `ResponseEnd`.
    ResponseTrailers { id: Uuid, trailers: HeaderList },
    /// agent → edge: response complete.
    ResponseEnd { id: Uuid },
    /// agent → edge: origin or agent-side error.
    ResponseError { id: Uuid, message: String },
    /// Liveness probe, either direction.
    Ping,
    /// Reply to `Ping`.
    Pong,
}

impl TunnelEvent {
    /// The request id this frame belongs to, if any.
    pub fn id(&self) -> Option<Uuid> {
        match self {
            TunnelEvent::Request { id, .. }
            | TunnelEvent::RequestData { id, .. }
            | TunnelEvent::RequestDataBatch { id, .. }
            | TunnelEvent::RequestEnd { id }
            | TunnelEvent::RequestError { id, .. }
            | TunnelEvent::Response { id, .. }
            | TunnelEvent::ResponseData { id, .. }
            | TunnelEvent::ResponseDataBatch { id, .. }
            | TunnelEvent::ResponseTrailers { id, .. }
            | TunnelEvent::ResponseEnd { id }
            | TunnelEvent::ResponseError { id, .. } => Some(*id),
            TunnelEvent::Ping | TunnelEvent::Pong => None,
        }
    }
}

/// Which on-wire event-name family to emit.
///
/// Decoding always accepts both; encoding picks the family matching the
/// request's [`Flavor`] so that peers with split HTTP/1 and HTTP/2 paths
/// interoperate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFamily {
    Http1,
    Http2,
}

impl From<Flavor> for WireFamily {
    fn from(flavor: Flavor) -> Self {
        match flavor {
            Flavor::Http1 => WireFamily::Http1,
            Flavor::Http2 => WireFamily::Http2,
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake contract
// ---------------------------------------------------------------------------

/// Names and messages fixed by the control-channel handshake.
pub mod handshake {
    /// The reserved control-channel path on the edge.  Public requests to
    /// any other path are dispatched through the tunnel.
    pub const CONTROL_PATH: &str = "/$web_tunnel";
    /// Handshake header: the agent's advertised URL path prefix (may be
    /// empty or absent for the whole-host wildcard).
    pub const PATH_PREFIX_HEADER: &str = "path-prefix";
    /// Handshake header: `"true"` when the agent can open HTTP/2 requests
    /// toward its local origin.
    pub const SUPPORTS_HTTP2_HEADER: &str = "supports-http2";
    /// Close reason sent when token verification fails.
    pub const AUTH_ERROR_REASON: &str = "Authentication error";

    /// Close reason sent when `(host, path-prefix)` is already registered.
    pub fn duplicate_reason(host: &str) -> String {
        format!("{} has a existing connection", host)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Frame codec failures.
///
/// A decode error on the control channel is a protocol violation: the
/// receiving end tears the channel down rather than guessing.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event name: {0}")]
    UnknownEvent(String),
    #[error("event {event} is missing its {field} field")]
    MissingField { event: &'static str, field: &'static str },
    #[error("event {0} carries no request id")]
    MissingRequestId(&'static str),
    #[error("invalid base64 payload: {0}")]
    Payload(#[from] base64::DecodeError),
    #[error("trailers are only representable in the http2 event family")]
    TrailersFlavor,
}
