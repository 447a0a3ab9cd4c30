//! Control-channel endpoint: one authenticated WebSocket session per agent.
//!
//! A session moves strictly through connecting (transport upgrade) →
//! authenticating (token + handshake headers) → ready (frames flow) →
//! closed; draining happens at edge shutdown via
//! [`AgentRegistry::drain_all`].  All outgoing frames funnel through one
//! writer task per channel (the single serialization point), fed by a
//! bounded queue so that a slow control socket suspends every producer.

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnel_protocol::{TunnelEvent, WireFamily, handshake};
use uuid::Uuid;

use crate::AppState;
use crate::auth;
use crate::registry::{AgentChannel, OutboundFrame};
use crate::streams::{BodyEvent, Inflight, RouteOutcome};

/// Protocol-level ping cadence; peers expect one at least every 25 s.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
/// Inbound silence past this closes the channel: three missed heartbeats.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);
const FRAME_QUEUE_CAPACITY: usize = 64;

/// Synthetic failure message applied to inflight requests on channel loss.
pub const CHANNEL_LOST: &str = "tunnel channel closed";

pub async fn ws_tunnel_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::extract_bearer)
        .is_some_and(|token| {
            auth::verify_token(&state.config.secret_key, &state.config.verify_token, token)
        });
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let path_prefix = headers
        .get(handshake::PATH_PREFIX_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let caps_http2 = headers
        .get(handshake::SUPPORTS_HTTP2_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    ws.on_upgrade(move |socket| async move {
        if !authorized || host.is_empty() {
            warn!(host, "agent rejected at handshake");
            close_with(socket, handshake::AUTH_ERROR_REASON).await;
            return;
        }
        run_channel(socket, state, host, path_prefix, caps_http2).await;
    })
}

/// Close the socket with a policy-violation close frame carrying `reason`.
/// The rejection must actually end the connection, not just be reported.
async fn close_with(mut socket: WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.to_owned().into(),
        })))
        .await;
}

async fn run_channel(
    socket: WebSocket,
    state: AppState,
    host: String,
    path_prefix: String,
    caps_http2: bool,
) {
    let channel_id = Uuid::new_v4();
    let (frame_tx, frame_rx) = mpsc::channel::<OutboundFrame>(FRAME_QUEUE_CAPACITY);
    let inflight = Inflight::default();
    let channel = AgentChannel::new(channel_id, caps_http2, frame_tx.clone(), inflight.clone());

    if !state.registry.register(&host, &path_prefix, channel).await {
        warn!(host, path_prefix, "duplicate registration refused");
        close_with(socket, &handshake::duplicate_reason(&host)).await;
        return;
    }
    info!(host, path_prefix, caps_http2, %channel_id, "agent registered");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, frame_rx));
    // Heartbeats get their own task so pings keep flowing while the reader
    // is suspended on a backpressured request.
    let heartbeat = tokio::spawn(heartbeat_loop(frame_tx.clone()));
    read_loop(stream, &frame_tx, &inflight).await;

    // Teardown order matters: stop routing new requests to this channel,
    // then fail whatever was inflight on it.
    state.registry.remove(&host, &path_prefix, channel_id).await;
    inflight.fail_all(CHANNEL_LOST).await;
    heartbeat.abort();
    writer.abort();
    info!(host, %channel_id, "agent channel closed");
}

async fn heartbeat_loop(frame_tx: mpsc::Sender<OutboundFrame>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let ping = OutboundFrame { event: TunnelEvent::Ping, family: WireFamily::Http1 };
        if frame_tx.send(ping).await.is_err() {
            break;
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(OutboundFrame { event, family }) = frames.recv().await {
        let text = match tunnel_protocol::encode(&event, family) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "dropping unencodable frame");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    frame_tx: &mpsc::Sender<OutboundFrame>,
    inflight: &Inflight,
) {
    loop {
        match tokio::time::timeout(LIVENESS_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match tunnel_protocol::decode(&text) {
                Ok(event) => route_inbound(event, frame_tx, inflight).await,
                Err(e) => {
                    warn!(error = %e, "protocol violation on control channel");
                    break;
                }
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                info!("agent disconnected");
                break;
            }
            // Transport-level ping/pong is answered by axum itself.
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                warn!(error = %e, "control socket error");
                break;
            }
            Err(_) => {
                warn!("control channel silent past liveness timeout");
                break;
            }
        }
    }
}

/// Route one inbound frame to its per-request handles.
async fn route_inbound(
    event: TunnelEvent,
    frame_tx: &mpsc::Sender<OutboundFrame>,
    inflight: &Inflight,
) {
    let request_id = event.id();
    let outcome = match event {
        TunnelEvent::Response { id, descriptor } => inflight.on_response(id, Ok(descriptor)).await,
        TunnelEvent::ResponseError { id, message } => inflight.on_response(id, Err(message)).await,
        TunnelEvent::ResponseData { id, data } => {
            inflight.on_body_event(id, BodyEvent::Data(data)).await
        }
        TunnelEvent::ResponseDataBatch { id, chunks } => {
            let mut outcome = RouteOutcome::Delivered;
            for data in chunks {
                outcome = inflight.on_body_event(id, BodyEvent::Data(data)).await;
                if outcome != RouteOutcome::Delivered {
                    break;
                }
            }
            outcome
        }
        TunnelEvent::ResponseTrailers { id, trailers } => {
            inflight.on_body_event(id, BodyEvent::Trailers(trailers)).await
        }
        TunnelEvent::ResponseEnd { id } => inflight.on_body_event(id, BodyEvent::End).await,
        TunnelEvent::Ping => {
            let pong = OutboundFrame { event: TunnelEvent::Pong, family: WireFamily::Http1 };
            let _ = frame_tx.send(pong).await;
            return;
        }
        TunnelEvent::Pong => return,
        // Request-side frames only ever travel edge → agent.
        other => {
            warn!(?other, "unexpected request-family frame from agent");
            return;
        }
    };

    match outcome {
        RouteOutcome::Delivered => {}
        RouteOutcome::Gone(family) => {
            // The public client went away; tell the agent to stop.
            if let Some(id) = request_id {
                let _ = frame_tx
                    .send(OutboundFrame {
                        event: TunnelEvent::RequestError {
                            id,
                            message: "client closed connection".to_owned(),
                        },
                        family,
                    })
                    .await;
            }
        }
        RouteOutcome::Unknown => {
            debug!("frame for unknown request id dropped");
        }
    }
}
