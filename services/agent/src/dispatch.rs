//! Agent dispatcher: serves each inbound `request` frame against the local
//! origin and pumps the answer back as response frames.
//!
//! http1 flavor opens a per-request origin connection (with upgrade
//! support for tunneled WebSockets); http2 flavor multiplexes onto the
//! shared origin session from [`crate::origin`].  Either way the emission
//! order holds: `response`, data, trailers (http2 only), then `end`, or a
//! single `response-error`.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Incoming;
use hyper::http::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnel_protocol::headers as hdr;
use tunnel_protocol::{
    Flavor, HeaderList, RequestDescriptor, ResponseDescriptor, TunnelEvent, WireFamily,
};
use uuid::Uuid;

use crate::origin::{OriginBody, OriginClient, OriginError};
use crate::streams::{Inflight, RequestBodyEvent};
use crate::uplink::{FrameTx, OutboundFrame};

const SPLICE_BUF_SIZE: usize = 16 * 1024;

/// Handle one `request` frame: admit it into the inflight table and spawn
/// its pump task.  Called from the channel reader, which processes frames
/// in order, so body frames for this id cannot overtake the registration.
pub async fn spawn_request(
    origin: std::sync::Arc<OriginClient>,
    frames: FrameTx,
    inflight: Inflight,
    id: Uuid,
    descriptor: RequestDescriptor,
) {
    let family = WireFamily::from(descriptor.flavor);
    let (body_tx, body_rx) = Inflight::body_channel();
    inflight.register(id, body_tx).await;

    let task_inflight = inflight.clone();
    let task = tokio::spawn(async move {
        info!(%id, method = %descriptor.method, path = %descriptor.path, ?descriptor.flavor, "serving tunneled request");
        let result = match descriptor.flavor {
            Flavor::Http1 => serve_http1(&origin, &frames, id, family, &descriptor, body_rx).await,
            Flavor::Http2 => serve_http2(&origin, &frames, id, family, &descriptor, body_rx).await,
        };
        if let Err(e) = result {
            debug!(%id, error = %e, "tunneled request failed");
            let _ = frames
                .send(OutboundFrame {
                    event: TunnelEvent::ResponseError { id, message: e.to_string() },
                    family,
                })
                .await;
        }
        task_inflight.complete(id).await;
    });
    inflight.set_abort(id, task.abort_handle()).await;
}

// ---------------------------------------------------------------------------
// http1 flavor
// ---------------------------------------------------------------------------

async fn serve_http1(
    origin: &OriginClient,
    frames: &FrameTx,
    id: Uuid,
    family: WireFamily,
    descriptor: &RequestDescriptor,
    body_rx: mpsc::Receiver<RequestBodyEvent>,
) -> Result<(), OriginError> {
    if hdr::header_value(&descriptor.headers, "upgrade").is_some() {
        return serve_http1_upgrade(origin, frames, id, family, descriptor, body_rx).await;
    }

    let req = build_h1_request(descriptor, request_body(body_rx))?;
    let response = origin.h1_request(req).await?;
    if !send_response_head(frames, id, family, &response).await {
        return Ok(());
    }
    pump_response_body(frames, id, family, response.into_body(), false).await
}

/// Tunneled Upgrade request (WebSocket et al.): the body stays empty until
/// the origin answers 101, after which the raw bytes of both directions
/// ride the data frames.
async fn serve_http1_upgrade(
    origin: &OriginClient,
    frames: &FrameTx,
    id: Uuid,
    family: WireFamily,
    descriptor: &RequestDescriptor,
    body_rx: mpsc::Receiver<RequestBodyEvent>,
) -> Result<(), OriginError> {
    let req = build_h1_request(descriptor, empty_body())?;
    let mut response = origin.h1_request(req).await?;
    let status = response.status();
    if !send_response_head(frames, id, family, &response).await {
        return Ok(());
    }
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return pump_response_body(frames, id, family, response.into_body(), false).await;
    }

    let upgraded = hyper::upgrade::on(&mut response)
        .await
        .map_err(OriginError::Upgrade)?;
    splice_origin(frames, id, family, upgraded, body_rx).await;
    Ok(())
}

fn build_h1_request(
    descriptor: &RequestDescriptor,
    body: OriginBody,
) -> Result<Request<OriginBody>, OriginError> {
    // http1 flavor passes headers as-is; only pseudo-headers (from a
    // downgraded h2 peer) are dropped.
    let mut builder = Request::builder()
        .method(descriptor.method.as_str())
        .uri(descriptor.path.as_str());
    for (name, value) in &descriptor.headers {
        if hdr::is_pseudo(name) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    Ok(builder.body(body)?)
}

// ---------------------------------------------------------------------------
// http2 flavor
// ---------------------------------------------------------------------------

async fn serve_http2(
    origin: &OriginClient,
    frames: &FrameTx,
    id: Uuid,
    family: WireFamily,
    descriptor: &RequestDescriptor,
    body_rx: mpsc::Receiver<RequestBodyEvent>,
) -> Result<(), OriginError> {
    let handle = origin.h2_handle().await?;
    let fallback_authority = origin.authority();
    let req = build_h2_request(descriptor, handle.scheme, &fallback_authority, request_body(body_rx))?;

    let mut send = handle.send;
    send.ready().await.map_err(OriginError::Request)?;
    let response = send.send_request(req).await.map_err(OriginError::Request)?;

    if !send_response_head(frames, id, family, &response).await {
        return Ok(());
    }
    pump_response_body(frames, id, family, response.into_body(), true).await
}

/// Headers that must not cross into an HTTP/2 request.  `te` survives only
/// as `te: trailers` on gRPC traffic.
fn skip_for_h2(name: &str, grpc: bool) -> bool {
    match name.to_ascii_lowercase().as_str() {
        "host" | "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
        | "upgrade" => true,
        "te" => !grpc,
        _ => false,
    }
}

fn build_h2_request(
    descriptor: &RequestDescriptor,
    scheme: &'static str,
    fallback_authority: &str,
    body: OriginBody,
) -> Result<Request<OriginBody>, OriginError> {
    // Pseudo-headers are derived, not copied: `:method`/`:path` from the
    // descriptor, `:authority` from its Host header (or the local origin
    // when a bare HTTP/1.0-ish request had none), `:scheme` from the
    // actual origin transport.
    let authority = hdr::header_value(&descriptor.headers, "host").unwrap_or(fallback_authority);
    let uri = Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(descriptor.path.as_str())
        .build()?;

    let grpc = hdr::is_grpc(&descriptor.headers);
    let mut builder = Request::builder()
        .method(descriptor.method.as_str())
        .uri(uri)
        .version(Version::HTTP_2);
    for (name, value) in &descriptor.headers {
        if hdr::is_pseudo(name) || skip_for_h2(name, grpc) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if grpc && hdr::header_value(&descriptor.headers, "te").is_none() {
        builder = builder.header("te", "trailers");
    }
    Ok(builder.body(body)?)
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

async fn send_frame(frames: &FrameTx, event: TunnelEvent, family: WireFamily) -> bool {
    frames.send(OutboundFrame { event, family }).await.is_ok()
}

async fn send_response_head(
    frames: &FrameTx,
    id: Uuid,
    family: WireFamily,
    response: &Response<Incoming>,
) -> bool {
    let descriptor = ResponseDescriptor {
        status: response.status().as_u16(),
        status_message: response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_owned(),
        headers: header_list(response.headers()),
    };
    send_frame(frames, TunnelEvent::Response { id, descriptor }, family).await
}

fn header_list(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect()
}

/// The streaming request body toward the origin, fed by inbound
/// `request-data` frames.  A feed that closes without `End` aborts the
/// stream rather than finishing it cleanly.
fn request_body(mut body_rx: mpsc::Receiver<RequestBodyEvent>) -> OriginBody {
    let stream = async_stream::stream! {
        loop {
            match body_rx.recv().await {
                Some(RequestBodyEvent::Data(data)) => yield Ok(http_body::Frame::data(data)),
                Some(RequestBodyEvent::End) => break,
                None => {
                    yield Err(std::io::Error::other("tunnel request aborted"));
                    break;
                }
            }
        }
    };
    BodyExt::boxed_unsync(StreamBody::new(stream))
}

fn empty_body() -> OriginBody {
    BodyExt::boxed_unsync(Empty::<Bytes>::new().map_err(|never| match never {}))
}

/// Stream the origin's body frames back through the tunnel, trailers
/// (http2 only) immediately before `response-end`.
async fn pump_response_body(
    frames: &FrameTx,
    id: Uuid,
    family: WireFamily,
    mut body: Incoming,
    trailers_allowed: bool,
) -> Result<(), OriginError> {
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(OriginError::Request)?;
        match frame.into_data() {
            Ok(data) => {
                if data.is_empty() {
                    continue;
                }
                if !send_frame(frames, TunnelEvent::ResponseData { id, data }, family).await {
                    return Ok(());
                }
            }
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    if trailers_allowed && !trailers.is_empty() {
                        let event = TunnelEvent::ResponseTrailers { id, trailers: header_list(&trailers) };
                        if !send_frame(frames, event, family).await {
                            return Ok(());
                        }
                    } else if !trailers.is_empty() {
                        warn!(%id, "origin sent trailers on an http1-flavored request, dropping");
                    }
                }
            }
        }
    }
    send_frame(frames, TunnelEvent::ResponseEnd { id }, family).await;
    Ok(())
}

/// Bidirectional splice after a 101: origin reads become `response-data`,
/// inbound `request-data` becomes origin writes.
async fn splice_origin(
    frames: &FrameTx,
    id: Uuid,
    family: WireFamily,
    upgraded: hyper::upgrade::Upgraded,
    mut body_rx: mpsc::Receiver<RequestBodyEvent>,
) {
    let (mut read_half, mut write_half) = tokio::io::split(hyper_util::rt::TokioIo::new(upgraded));

    let origin_to_edge = async {
        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = send_frame(frames, TunnelEvent::ResponseEnd { id }, family).await;
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if !send_frame(frames, TunnelEvent::ResponseData { id, data }, family).await {
                        break;
                    }
                }
                Err(e) => {
                    let event = TunnelEvent::ResponseError { id, message: e.to_string() };
                    let _ = send_frame(frames, event, family).await;
                    break;
                }
            }
        }
    };

    let edge_to_origin = async {
        loop {
            match body_rx.recv().await {
                Some(RequestBodyEvent::Data(data)) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(RequestBodyEvent::End) | None => break,
            }
        }
        let _ = write_half.shutdown().await;
    };

    tokio::join!(origin_to_edge, edge_to_origin);
    debug!(%id, "origin splice finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(flavor: Flavor, headers: &[(&str, &str)]) -> RequestDescriptor {
        RequestDescriptor {
            method: "POST".to_owned(),
            path: "/pkg.Svc/Method".to_owned(),
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_owned(), (*v).to_owned()))
                .collect(),
            flavor,
        }
    }

    #[test]
    fn h2_request_derives_pseudo_headers_and_keeps_grpc_headers() {
        let d = descriptor(
            Flavor::Http2,
            &[
                ("host", "example.test"),
                ("content-type", "application/grpc"),
                ("grpc-timeout", "1S"),
                ("connection", "keep-alive"),
            ],
        );
        let req = build_h2_request(&d, "http", "localhost:8080", empty_body()).expect("request");

        assert_eq!(req.uri().authority().unwrap().as_str(), "example.test");
        assert_eq!(req.uri().scheme_str(), Some("http"));
        assert_eq!(req.uri().path(), "/pkg.Svc/Method");
        assert_eq!(req.version(), Version::HTTP_2);
        // Host and connection-ish headers must not cross; grpc-* must.
        assert!(req.headers().get("host").is_none());
        assert!(req.headers().get("connection").is_none());
        assert_eq!(req.headers().get("grpc-timeout").unwrap(), "1S");
        // te: trailers injected for gRPC.
        assert_eq!(req.headers().get("te").unwrap(), "trailers");
    }

    #[test]
    fn h2_request_without_host_uses_the_local_authority() {
        let d = descriptor(Flavor::Http2, &[("content-type", "application/grpc")]);
        let req = build_h2_request(&d, "https", "localhost:9000", empty_body()).expect("request");
        assert_eq!(req.uri().authority().unwrap().as_str(), "localhost:9000");
    }

    #[test]
    fn h2_request_drops_te_on_non_grpc_traffic() {
        let d = descriptor(
            Flavor::Http2,
            &[("host", "h.test"), ("te", "trailers"), ("content-type", "text/plain")],
        );
        let req = build_h2_request(&d, "http", "localhost:8080", empty_body()).expect("request");
        assert!(req.headers().get("te").is_none());
    }

    #[test]
    fn h1_request_passes_headers_as_is() {
        let d = descriptor(
            Flavor::Http1,
            &[("host", "example.test"), ("x-custom", "1"), (":path", "/ignored")],
        );
        let req = build_h1_request(&d, empty_body()).expect("request");

        assert_eq!(req.uri().to_string(), "/pkg.Svc/Method");
        assert_eq!(req.headers().get("host").unwrap(), "example.test");
        assert_eq!(req.headers().get("x-custom").unwrap(), "1");
        assert!(req.headers().get(":path").is_none());
    }
}
