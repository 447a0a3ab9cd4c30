//! A cleartext HTTP/2 origin that behaves like a unary gRPC server: echoes
//! the length-prefixed request message and finishes with `grpc-status: 0`
//! trailers.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;

pub struct MockGrpcOrigin {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl MockGrpcOrigin {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    // Connections that fail the h2 preface (e.g. a probing
                    // TLS ClientHello) just end; the accept loop goes on.
                    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service_fn(unary_echo))
                        .await;
                });
            }
        });
        Ok(MockGrpcOrigin { addr, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn unary_echo(
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    let message = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from_static("0"));

    let frames = futures_util::stream::iter(vec![
        Ok::<_, Infallible>(http_body::Frame::data(message)),
        Ok(http_body::Frame::trailers(trailers)),
    ]);

    let response = Response::builder()
        .status(200)
        .header("content-type", "application/grpc")
        .body(BodyExt::boxed(StreamBody::new(frames)))
        .expect("static response parts");
    Ok(response)
}
