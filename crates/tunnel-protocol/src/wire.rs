// Wire form: one JSON object per frame, `event` naming the kind and the
// remaining fields carrying the positional arguments.  Body bytes travel
// base64-encoded so the frames stay valid text.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    HeaderList, ProtocolError, RequestDescriptor, ResponseDescriptor, TunnelEvent, WireFamily,
};

/// Base event names (the `http2-` prefixed family is derived from these).
pub mod event_names {
    pub const REQUEST: &str = "request";
    pub const REQUEST_DATA: &str = "request-data";
    pub const REQUEST_DATA_BATCH: &str = "request-data-batch";
    pub const REQUEST_END: &str = "request-end";
    pub const REQUEST_ERROR: &str = "request-error";
    pub const RESPONSE: &str = "response";
    pub const RESPONSE_DATA: &str = "response-data";
    pub const RESPONSE_DATA_BATCH: &str = "response-data-batch";
    pub const RESPONSE_TRAILERS: &str = "response-trailers";
    pub const RESPONSE_END: &str = "response-end";
    pub const RESPONSE_ERROR: &str = "response-error";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";

    pub const HTTP2_PREFIX: &str = "http2-";
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireDescriptor {
    Request(RequestDescriptor),
    Response(ResponseDescriptor),
}

/// The serialized frame shape.  Fields not used by an event kind are
/// omitted entirely rather than serialized as null.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    descriptor: Option<WireDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trailers: Option<HeaderList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl RawFrame {
    fn named(event: String) -> Self {
        RawFrame { event, ..RawFrame::default() }
    }
}

fn family_name(base: &'static str, family: WireFamily) -> String {
    match family {
        WireFamily::Http1 => base.to_owned(),
        WireFamily::Http2 => format!("{}{}", event_names::HTTP2_PREFIX, base),
    }
}

/// Serialize a frame as a JSON text message, emitting the event names of
/// the given wire family.  `Ping`/`Pong` are family-less.
///
/// Encoding [`TunnelEvent::ResponseTrailers`] with the http1 family fails:
/// that family has no trailer event.
pub fn encode(event: &TunnelEvent, family: WireFamily) -> Result<String, ProtocolError> {
    use event_names as n;

    let raw = match event {
        TunnelEvent::Request { id, descriptor } => RawFrame {
            id: Some(*id),
            descriptor: Some(WireDescriptor::Request(descriptor.clone())),
            ..RawFrame::named(family_name(n::REQUEST, family))
        },
        TunnelEvent::RequestData { id, data } => RawFrame {
            id: Some(*id),
            data: Some(B64.encode(data)),
            ..RawFrame::named(family_name(n::REQUEST_DATA, family))
        },
        TunnelEvent::RequestDataBatch { id, chunks } => RawFrame {
            id: Some(*id),
            chunks: Some(chunks.iter().map(|c| B64.encode(c)).collect()),
            ..RawFrame::named(family_name(n::REQUEST_DATA_BATCH, family))
        },
        TunnelEvent::RequestEnd { id } => RawFrame {
            id: Some(*id),
            ..RawFrame::named(family_name(n::REQUEST_END, family))
        },
        TunnelEvent::RequestError { id, message } => RawFrame {
            id: Some(*id),
            message: Some(message.clone()),
            ..RawFrame::named(family_name(n::REQUEST_ERROR, family))
        },
        TunnelEvent::Response { id, descriptor } => RawFrame {
            id: Some(*id),
            descriptor: Some(WireDescriptor::Response(descriptor.clone())),
            ..RawFrame::named(family_name(n::RESPONSE, family))
        },
        TunnelEvent::ResponseData { id, data } => RawFrame {
            id: Some(*id),
            data: Some(B64.encode(data)),
            ..RawFrame::named(family_name(n::RESPONSE_DATA, family))
        },
        TunnelEvent::ResponseDataBatch { id, chunks } => RawFrame {
            id: Some(*id),
            chunks: Some(chunks.iter().map(|c| B64.encode(c)).collect()),
            ..RawFrame::named(family_name(n::RESPONSE_DATA_BATCH, family))
        },
        TunnelEvent::ResponseTrailers { id, trailers } => {
            if family == WireFamily::Http1 {
                return Err(ProtocolError::TrailersFlavor);
            }
            RawFrame {
                id: Some(*id),
                trailers: Some(trailers.clone()),
                ..RawFrame::named(family_name(n::RESPONSE_TRAILERS, family))
            }
        }
        TunnelEvent::ResponseEnd { id } => RawFrame {
            id: Some(*id),
            ..RawFrame::named(family_name(n::RESPONSE_END, family))
        },
        TunnelEvent::ResponseError { id, message } => RawFrame {
            id: Some(*id),
            message: Some(message.clone()),
            ..RawFrame::named(family_name(n::RESPONSE_ERROR, family))
        },
        TunnelEvent::Ping => RawFrame::named(n::PING.to_owned()),
        TunnelEvent::Pong => RawFrame::named(n::PONG.to_owned()),
    };

    Ok(serde_json::to_string(&raw)?)
}

/// Parse one JSON text message into the unified [`TunnelEvent`].
///
/// Both event-name families are accepted; the `http2-` prefix is stripped
/// before matching, so `http2-request` and `request` decode identically
/// (the descriptor's `flavor` field is authoritative for semantics).
pub fn decode(text: &str) -> Result<TunnelEvent, ProtocolError> {
    use event_names as n;

    let raw: RawFrame = serde_json::from_str(text)?;
    let base = raw
        .event
        .strip_prefix(n::HTTP2_PREFIX)
        .unwrap_or(raw.event.as_str());

    // ping/pong never carry an id; everything else must.
    match base {
        n::PING => return Ok(TunnelEvent::Ping),
        n::PONG => return Ok(TunnelEvent::Pong),
        _ => {}
    }

    let event = match base {
        n::REQUEST => "request",
        n::REQUEST_DATA => "request-data",
        n::REQUEST_DATA_BATCH => "request-data-batch",
        n::REQUEST_END => "request-end",
        n::REQUEST_ERROR => "request-error",
        n::RESPONSE => "response",
        n::RESPONSE_DATA => "response-data",
        n::RESPONSE_DATA_BATCH => "response-data-batch",
        n::RESPONSE_TRAILERS => "response-trailers",
        n::RESPONSE_END => "response-end",
        n::RESPONSE_ERROR => "response-error",
        _ => return Err(ProtocolError::UnknownEvent(raw.event)),
    };
    let id = raw.id.ok_or(ProtocolError::MissingRequestId(event))?;

    let decoded = match base {
        n::REQUEST => match raw.descriptor {
            Some(WireDescriptor::Request(descriptor)) => TunnelEvent::Request { id, descriptor },
            _ => return Err(ProtocolError::MissingField { event, field: "descriptor" }),
        },
        n::REQUEST_DATA => TunnelEvent::RequestData { id, data: decode_data(raw.data, event)? },
        n::REQUEST_DATA_BATCH => {
            TunnelEvent::RequestDataBatch { id, chunks: decode_chunks(raw.chunks, event)? }
        }
        n::REQUEST_END => TunnelEvent::RequestEnd { id },
        n::REQUEST_ERROR => TunnelEvent::RequestError {
            id,
            message: raw
                .message
                .ok_or(ProtocolError::MissingField { event, field: "message" })?,
        },
        n::RESPONSE => match raw.descriptor {
            Some(WireDescriptor::Response(descriptor)) => TunnelEvent::Response { id, descriptor },
            _ => return Err(ProtocolError::MissingField { event, field: "descriptor" }),
        },
        n::RESPONSE_DATA => TunnelEvent::ResponseData { id, data: decode_data(raw.data, event)? },
        n::RESPONSE_DATA_BATCH => {
            TunnelEvent::ResponseDataBatch { id, chunks: decode_chunks(raw.chunks, event)? }
        }
        n::RESPONSE_TRAILERS => TunnelEvent::ResponseTrailers {
            id,
            trailers: raw
                .trailers
                .ok_or(ProtocolError::MissingField { event, field: "trailers" })?,
        },
        n::RESPONSE_END => TunnelEvent::ResponseEnd { id },
        n::RESPONSE_ERROR => TunnelEvent::ResponseError {
            id,
            message: raw
                .message
                .ok_or(ProtocolError::MissingField { event, field: "message" })?,
        },
        _ => unreachable!("event name matched above"),
    };
    Ok(decoded)
}

fn decode_data(data: Option<String>, event: &'static str) -> Result<Bytes, ProtocolError> {
    let encoded = data.ok_or(ProtocolError::MissingField { event, field: "data" })?;
    Ok(Bytes::from(B64.decode(encoded)?))
}

fn decode_chunks(
    chunks: Option<Vec<String>>,
    event: &'static str,
) -> Result<Vec<Bytes>, ProtocolError> {
    let encoded = chunks.ok_or(ProtocolError::MissingField { event, field: "chunks" })?;
    encoded
        .into_iter()
        .map(|c| Ok(Bytes::from(B64.decode(c)?)))
        .collect()
}
