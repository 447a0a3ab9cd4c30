//! Edge dispatcher: turns each public request into a tunneled request on
//! the agent's control channel and streams the agent's response frames back
//! to the public client.
//!
//! Every path except the two reserved routes lands here via the router
//! fallback, including HTTP/1.1 `Upgrade` requests (tunneled and spliced
//! after a 101) and HTTP/2 / gRPC requests (full-duplex, with trailers).

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::StreamBody;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnel_protocol::headers as hdr;
use tunnel_protocol::{Flavor, HeaderList, RequestDescriptor, ResponseDescriptor, TunnelEvent, WireFamily};
use uuid::Uuid;

use crate::AppState;
use crate::registry::AgentChannel;
use crate::serve::ClientMeta;
use crate::streams::BodyEvent;

const SPLICE_BUF_SIZE: usize = 16 * 1024;

pub async fn dispatch_handler(State(state): State<AppState>, mut req: Request) -> Response {
    let Some(host) = request_host(&req) else {
        return not_found();
    };
    let Some(agent) = state.registry.resolve(&host, req.uri().path()).await else {
        debug!(host, path = req.uri().path(), "no agent for request");
        return not_found();
    };

    let meta = req.extensions().get::<ClientMeta>().copied().unwrap_or_default();
    let version = req.version();
    let flavor = determine_flavor(version, req.headers(), agent.caps_http2());
    let family = WireFamily::from(flavor);

    // An HTTP/1.1 Upgrade request (WebSocket etc.) tunnels like any other
    // request; the raw socket is spliced once the agent answers 101.
    let on_upgrade = if flavor == Flavor::Http1
        && version <= Version::HTTP_11
        && req.headers().contains_key(header::UPGRADE)
    {
        req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>()
    } else {
        None
    };

    let descriptor = RequestDescriptor {
        method: req.method().as_str().to_owned(),
        path: req
            .uri()
            .path_and_query()
            .map_or_else(|| req.uri().path().to_owned(), |pq| pq.as_str().to_owned()),
        headers: forwarded_header_list(req.headers(), meta, &host),
        flavor,
    };

    let id = Uuid::new_v4();
    let handles = agent.inflight().insert(id, family).await;
    if agent.send(TunnelEvent::Request { id, descriptor }, family).await.is_err() {
        agent.inflight().remove(id).await;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    info!(%id, host, method = %req.method(), path = req.uri().path(), ?flavor, "request tunneled");

    if on_upgrade.is_none() {
        tokio::spawn(pump_request_body(agent.clone(), id, family, req.into_body()));
    }

    match handles.response.await {
        // Channel torn down before the agent answered.
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        // Agent-side failure before any response head.
        Ok(Err(message)) => {
            info!(%id, message, "agent reported request error");
            (StatusCode::BAD_GATEWAY, "Request error").into_response()
        }
        Ok(Ok(descriptor)) => match on_upgrade {
            Some(on_upgrade) if descriptor.status == 101 => {
                spawn_splice(agent, id, family, on_upgrade, handles.body);
                switching_protocols_response(&descriptor)
            }
            // Origin refused the upgrade: relay its answer; the client
            // connection closes after an unconsummated upgrade.
            _ => build_response(version == Version::HTTP_2, &descriptor, handles.body),
        },
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Routing key: `Host` header for HTTP/1, URI authority for HTTP/2.
fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_owned()))
}

/// A request travels as http2 iff it arrived as HTTP/2 or carries a gRPC
/// content-type, and the serving agent can open HTTP/2 toward its origin.
fn determine_flavor(version: Version, headers: &HeaderMap, agent_caps_http2: bool) -> Flavor {
    let grpc = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/grpc"));
    if (version == Version::HTTP_2 || grpc) && agent_caps_http2 {
        Flavor::Http2
    } else {
        Flavor::Http1
    }
}

/// Copy the public request's headers into descriptor form and apply the
/// `X-Forwarded-*` additions.  The `Host` entry is guaranteed present so
/// the agent can always derive `:authority`.
fn forwarded_header_list(headers: &HeaderMap, meta: ClientMeta, host: &str) -> HeaderList {
    let mut list: HeaderList = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();

    let (port, proto) = if meta.tls { ("443", "https") } else { ("80", "http") };
    hdr::append_with_comma(&mut list, "x-forwarded-for", &meta.remote_addr.ip().to_string());
    hdr::append_with_comma(&mut list, "x-forwarded-port", port);
    hdr::append_with_comma(&mut list, "x-forwarded-proto", proto);
    hdr::set_if_absent(&mut list, "x-forwarded-host", host);
    hdr::set_if_absent(&mut list, "host", host);
    list
}

/// Stream the public request body into `request-data` frames.  Each send
/// is awaited before the next chunk is pulled, so a slow agent (or a full
/// control socket) suspends the read from the public client.
async fn pump_request_body(agent: AgentChannel, id: Uuid, family: WireFamily, body: Body) {
    let mut stream = body.into_data_stream();
    loop {
        match stream.next().await {
            Some(Ok(data)) => {
                if data.is_empty() {
                    continue;
                }
                if agent.send(TunnelEvent::RequestData { id, data }, family).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                // Public client aborted mid-body.
                debug!(%id, error = %e, "request body aborted");
                let _ = agent
                    .send(TunnelEvent::RequestError { id, message: e.to_string() }, family)
                    .await;
                agent.inflight().remove(id).await;
                return;
            }
            None => {
                let _ = agent.send(TunnelEvent::RequestEnd { id }, family).await;
                return;
            }
        }
    }
}

/// Assemble the public response: status + de-pseudoed headers, body fed
/// from the inbound frame queue.  Trailers are delivered only to HTTP/2
/// clients; HTTP/1.1 has no useful representation for them here.
fn build_response(
    client_is_h2: bool,
    descriptor: &ResponseDescriptor,
    body_rx: mpsc::Receiver<BodyEvent>,
) -> Response {
    let status = StatusCode::from_u16(descriptor.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        copy_header_list(headers, &descriptor.headers, client_is_h2);
    }
    builder
        .body(tunnel_body(body_rx, client_is_h2))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Headers that must not cross an HTTP/2 boundary.
fn is_connection_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

fn copy_header_list(target: &mut HeaderMap, list: &[(String, String)], client_is_h2: bool) {
    for (name, value) in hdr::strip_pseudo_headers(list) {
        if client_is_h2 && is_connection_header(&name) {
            continue;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                target.append(name, value);
            }
            _ => warn!(name, "dropping malformed response header"),
        }
    }
}

fn tunnel_body(mut body_rx: mpsc::Receiver<BodyEvent>, deliver_trailers: bool) -> Body {
    let stream = async_stream::stream! {
        loop {
            match body_rx.recv().await {
                Some(BodyEvent::Data(data)) => yield Ok(http_body::Frame::data(data)),
                Some(BodyEvent::Trailers(trailers)) => {
                    if deliver_trailers {
                        let mut map = HeaderMap::new();
                        copy_header_list(&mut map, &trailers, true);
                        yield Ok(http_body::Frame::trailers(map));
                    }
                }
                Some(BodyEvent::End) => break,
                Some(BodyEvent::Error(message)) => {
                    yield Err(std::io::Error::other(message));
                    break;
                }
                // Channel loss without a terminal frame is an abort, never
                // a clean end-of-body.
                None => {
                    yield Err(std::io::Error::other("tunnel stream aborted"));
                    break;
                }
            }
        }
    };
    Body::new(StreamBody::new(stream))
}

/// The 101 reply that consummates a tunneled upgrade: the agent's header
/// block verbatim (minus pseudo-headers), empty body.
fn switching_protocols_response(descriptor: &ResponseDescriptor) -> Response {
    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    if let Some(headers) = builder.headers_mut() {
        copy_header_list(headers, &descriptor.headers, false);
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn spawn_splice(
    agent: AgentChannel,
    id: Uuid,
    family: WireFamily,
    on_upgrade: hyper::upgrade::OnUpgrade,
    body_rx: mpsc::Receiver<BodyEvent>,
) {
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                splice_upgraded(&agent, id, family, upgraded, body_rx).await;
            }
            Err(e) => {
                warn!(%id, error = %e, "public upgrade failed");
                let _ = agent
                    .send(TunnelEvent::RequestError { id, message: e.to_string() }, family)
                    .await;
            }
        }
        agent.inflight().remove(id).await;
    });
}

/// Bidirectional splice between the upgraded public socket and the tunnel:
/// socket reads become `request-data`, `response-data` becomes socket
/// writes, until either direction closes.
async fn splice_upgraded(
    agent: &AgentChannel,
    id: Uuid,
    family: WireFamily,
    upgraded: hyper::upgrade::Upgraded,
    mut body_rx: mpsc::Receiver<BodyEvent>,
) {
    let (mut read_half, mut write_half) = tokio::io::split(hyper_util::rt::TokioIo::new(upgraded));

    let client_to_agent = async {
        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = agent.send(TunnelEvent::RequestEnd { id }, family).await;
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if agent.send(TunnelEvent::RequestData { id, data }, family).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = agent
                        .send(TunnelEvent::RequestError { id, message: e.to_string() }, family)
                        .await;
                    break;
                }
            }
        }
    };

    let agent_to_client = async {
        loop {
            match body_rx.recv().await {
                Some(BodyEvent::Data(data)) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(BodyEvent::Trailers(_)) => {}
                Some(BodyEvent::End | BodyEvent::Error(_)) | None => break,
            }
        }
        let _ = write_half.shutdown().await;
    };

    tokio::join!(client_to_agent, agent_to_client);
    debug!(%id, "upgrade splice finished");
}
