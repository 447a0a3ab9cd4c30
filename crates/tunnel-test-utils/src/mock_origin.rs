//! A plain HTTP/1 origin for tunnel tests.
//!
//! Routes:
//! - `GET /hello` → `200`, body `hi\n`
//! - `POST /echo` and `POST /upload` → streamed echo of the request body
//! - `GET /ws` → WebSocket echo (text and binary)
//! - `GET /headers` → one `name: value` line per request header
//! - `GET /stream` → an unbounded chunked body, one chunk every 50 ms
//! - anything else → `200` with this origin's marker string

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use futures_util::StreamExt;
use tokio::net::TcpListener;

pub struct MockOrigin {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl MockOrigin {
    /// Start with the default marker `origin`.
    pub async fn start() -> std::io::Result<Self> {
        Self::start_named("origin").await
    }

    /// Start an origin whose fallback response body is `marker`, so routing
    /// tests can tell origins apart.
    pub async fn start_named(marker: &str) -> std::io::Result<Self> {
        let app = Router::new()
            .route("/hello", get(|| async { "hi\n" }))
            .route("/echo", post(echo))
            .route("/upload", post(echo))
            .route("/ws", get(ws_echo))
            .route("/headers", get(dump_headers))
            .route("/stream", get(slow_stream))
            .fallback(any(marker_response))
            .with_state(marker.to_owned());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(MockOrigin { addr, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn echo(req: Request) -> Response {
    Body::from_stream(req.into_body().into_data_stream()).into_response()
}

async fn marker_response(State(marker): State<String>) -> String {
    marker
}

async fn dump_headers(headers: HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            format!("{}: {}\n", name.as_str(), value.to_str().unwrap_or("<binary>"))
        })
        .collect()
}

async fn slow_stream() -> Response {
    let stream = futures_util::stream::unfold(0u64, |n| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let chunk: Result<Bytes, std::io::Error> = Ok(Bytes::from(format!("chunk-{}\n", n)));
        Some((chunk, n + 1))
    });
    Body::from_stream(stream).into_response()
}

async fn ws_echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(handle_ws_echo)
}

async fn handle_ws_echo(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.next().await {
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}
