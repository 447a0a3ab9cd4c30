//! Agent uplink: the outbound control-channel session to the edge.
//!
//! Connects to `<server>/$web_tunnel` with the bearer token and the
//! `path-prefix` / `supports-http2` handshake headers, then demultiplexes
//! inbound frames into per-request pump tasks.  The session reconnects
//! forever with bounded exponential backoff; in-flight requests from a
//! previous channel never resume.  Frames leave through one writer task
//! fed by a bounded queue, the channel's single serialization point.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use tunnel_protocol::{TunnelEvent, WireFamily, handshake};

use crate::config::AgentConfig;
use crate::dispatch;
use crate::origin::OriginClient;
use crate::streams::{Inflight, RequestBodyEvent};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(5);
/// A refused duplicate registration must not be retried immediately.
const DUPLICATE_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Inbound silence past this abandons the channel and reconnects.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);
/// Bound on waiting for inflight requests at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const FRAME_QUEUE_CAPACITY: usize = 64;

/// One outgoing frame queued to the writer task, tagged with the wire
/// family it must be encoded as.
#[derive(Debug)]
pub struct OutboundFrame {
    pub event: TunnelEvent,
    pub family: WireFamily,
}

pub type FrameTx = mpsc::Sender<OutboundFrame>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Transport loss or protocol violation: reconnect with backoff.
    Retry,
    /// `(host, path-prefix)` already registered: extended delay first.
    Duplicate,
    /// Authentication rejected (or unusable config): exit nonzero.
    Fatal,
    /// Drained after SIGINT/SIGTERM: exit zero.
    Shutdown,
}

/// Run the agent until a signal or a fatal rejection.  Returns the process
/// exit code.
pub async fn run(config: AgentConfig) -> i32 {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(signal_bridge(shutdown_tx));
    run_with_shutdown(config, shutdown_rx).await
}

/// Forward SIGINT/SIGTERM into the drain flag the session loop watches.
/// The process does not exit here: `run_with_shutdown` returns 0 once the
/// inflight work has drained (or the drain bound expires).
async fn signal_bridge(shutdown: watch::Sender<bool>) {
    #[cfg(unix)]
    let terminated = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, draining"),
        () = terminated => info!("received SIGTERM, draining"),
    }
    let _ = shutdown.send(true);
}

/// Signal-free core of [`run`], also driven directly by the test suites.
pub async fn run_with_shutdown(config: AgentConfig, mut shutdown: watch::Receiver<bool>) -> i32 {
    let config = Arc::new(config);
    let origin = Arc::new(OriginClient::new(config.clone()));
    let mut backoff = RECONNECT_BASE;

    loop {
        match run_session(&config, &origin, &mut backoff, &mut shutdown).await {
            SessionEnd::Shutdown => {
                info!("agent shut down gracefully");
                return 0;
            }
            SessionEnd::Fatal => return 1,
            SessionEnd::Duplicate => {
                warn!(
                    delay_secs = DUPLICATE_RETRY_DELAY.as_secs(),
                    "registration key already in use, delaying reconnect"
                );
                if sleep_or_shutdown(DUPLICATE_RETRY_DELAY, &mut shutdown).await {
                    return 0;
                }
                backoff = RECONNECT_BASE;
            }
            SessionEnd::Retry => {
                debug!(delay_secs = backoff.as_secs(), "reconnecting");
                if sleep_or_shutdown(backoff, &mut shutdown).await {
                    return 0;
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
            }
        }
    }
}

/// True when shutdown fired during the wait.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

async fn run_session(
    config: &Arc<AgentConfig>,
    origin: &Arc<OriginClient>,
    backoff: &mut Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let url = format!("{}{}", config.server_url, handshake::CONTROL_PATH);
    let request = match build_ws_request(&url, config) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "cannot build control channel request");
            return SessionEnd::Fatal;
        }
    };

    let (ws, _response) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(error = %e, "control channel connect failed");
            return SessionEnd::Retry;
        }
    };
    info!(url, path_prefix = %config.path_prefix, "control channel connected");
    *backoff = RECONNECT_BASE;

    let (sink, stream) = ws.split();
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
    let writer = tokio::spawn(write_loop(sink, frame_rx));
    let inflight = Inflight::default();

    let end = read_loop(origin, stream, &frame_tx, &inflight, shutdown).await;

    // A new channel starts from nothing: whatever was in flight dies here.
    inflight.abort_all().await;
    writer.abort();
    end
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut frames: mpsc::Receiver<OutboundFrame>) {
    while let Some(OutboundFrame { event, family }) = frames.recv().await {
        match tunnel_protocol::encode(&event, family) {
            Ok(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "dropping unencodable frame"),
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    origin: &Arc<OriginClient>,
    mut stream: SplitStream<WsStream>,
    frame_tx: &FrameTx,
    inflight: &Inflight,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut draining = false;
    let mut drain_deadline: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

    loop {
        if draining && inflight.len().await == 0 {
            info!("inflight drained");
            return SessionEnd::Shutdown;
        }
        tokio::select! {
            msg = tokio::time::timeout(LIVENESS_TIMEOUT, stream.next()) => {
                match msg {
                    Ok(Some(Ok(Message::Text(text)))) => match tunnel_protocol::decode(&text) {
                        Ok(event) => handle_frame(origin, frame_tx, inflight, event, draining).await,
                        Err(e) => {
                            warn!(error = %e, "protocol violation from edge");
                            return SessionEnd::Retry;
                        }
                    },
                    Ok(Some(Ok(Message::Close(frame)))) => return classify_close(frame),
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "control socket error");
                        return SessionEnd::Retry;
                    }
                    Ok(None) => {
                        info!("edge closed the control channel");
                        return SessionEnd::Retry;
                    }
                    Err(_) => {
                        warn!("control channel silent past liveness timeout");
                        return SessionEnd::Retry;
                    }
                }
            }
            _ = shutdown.changed(), if !draining => {
                info!("shutdown requested, draining inflight requests");
                draining = true;
                drain_deadline = Some(Box::pin(tokio::time::sleep(DRAIN_TIMEOUT)));
            }
            () = async { drain_deadline.as_mut().expect("deadline set with draining").await }, if drain_deadline.is_some() => {
                warn!("drain timeout expired, aborting remaining requests");
                return SessionEnd::Shutdown;
            }
        }
    }
}

/// The edge rejects by closing with a reason; map it to what the agent
/// must do next.
fn classify_close(frame: Option<CloseFrame>) -> SessionEnd {
    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
    if reason == handshake::AUTH_ERROR_REASON {
        error!("authentication rejected by edge");
        SessionEnd::Fatal
    } else if reason.ends_with("has a existing connection") {
        SessionEnd::Duplicate
    } else {
        info!(reason, "edge closed the control channel");
        SessionEnd::Retry
    }
}

async fn handle_frame(
    origin: &Arc<OriginClient>,
    frame_tx: &FrameTx,
    inflight: &Inflight,
    event: TunnelEvent,
    draining: bool,
) {
    match event {
        TunnelEvent::Request { id, descriptor } => {
            if draining {
                let family = WireFamily::from(descriptor.flavor);
                let refuse = OutboundFrame {
                    event: TunnelEvent::ResponseError { id, message: "agent shutting down".to_owned() },
                    family,
                };
                let _ = frame_tx.send(refuse).await;
                return;
            }
            dispatch::spawn_request(origin.clone(), frame_tx.clone(), inflight.clone(), id, descriptor)
                .await;
        }
        TunnelEvent::RequestData { id, data } => {
            inflight.push_body(id, RequestBodyEvent::Data(data)).await;
        }
        TunnelEvent::RequestDataBatch { id, chunks } => {
            for data in chunks {
                inflight.push_body(id, RequestBodyEvent::Data(data)).await;
            }
        }
        TunnelEvent::RequestEnd { id } => {
            inflight.push_body(id, RequestBodyEvent::End).await;
        }
        TunnelEvent::RequestError { id, message } => {
            debug!(%id, message, "request aborted by edge");
            inflight.abort(id).await;
        }
        TunnelEvent::Ping => {
            let pong = OutboundFrame { event: TunnelEvent::Pong, family: WireFamily::Http1 };
            let _ = frame_tx.send(pong).await;
        }
        TunnelEvent::Pong => {}
        // Response-side frames only ever travel agent → edge.
        other => warn!(?other, "unexpected response-family frame from edge"),
    }
}

#[derive(Debug, thiserror::Error)]
enum UplinkError {
    #[error("connection setup: {0}")]
    Connect(String),
}

fn build_ws_request(
    url: &str,
    config: &AgentConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, UplinkError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| UplinkError::Connect(format!("invalid URL '{}': {}", url, e)))?;

    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        format!("Bearer {}", config.token)
            .parse()
            .map_err(|e| UplinkError::Connect(format!("invalid auth header: {}", e)))?,
    );
    headers.insert(
        handshake::PATH_PREFIX_HEADER,
        config
            .path_prefix
            .parse()
            .map_err(|e| UplinkError::Connect(format!("invalid path prefix: {}", e)))?,
    );
    headers.insert(
        handshake::SUPPORTS_HTTP2_HEADER,
        "true".parse().expect("static header value"),
    );
    Ok(request)
}
