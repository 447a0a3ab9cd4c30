//! End-to-end: a unary gRPC call over HTTP/2. Body bytes plus
//! `grpc-status` trailers must survive the tunnel.

mod support;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::{TokioExecutor, TokioIo};
use support::{start_agent, start_edge, wait_for_agent};
use tunnel_test_utils::MockGrpcOrigin;

#[tokio::test]
async fn grpc_unary_round_trips_with_trailers() {
    let origin = MockGrpcOrigin::start().await.expect("grpc origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/pkg.Svc/Method").await;

    // Public HTTP/2 client (cleartext, prior knowledge).
    let stream = tokio::net::TcpStream::connect(edge.addr).await.expect("connect edge");
    let (mut send, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .expect("h2 handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    // A 5-byte length-prefixed gRPC message.
    let message = b"\x00\x00\x00\x00\x05hello".to_vec();
    let request = hyper::Request::builder()
        .method("POST")
        .uri(format!("http://{}/pkg.Svc/Method", edge.host()))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(Full::new(Bytes::from(message.clone())))
        .expect("request");

    let response = send.send_request(request).await.expect("grpc call");
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("content-type").unwrap(), "application/grpc");

    let collected = response.into_body().collect().await.expect("collect body");
    let trailers = collected.trailers().cloned().expect("grpc trailers present");
    assert_eq!(collected.to_bytes().as_ref(), &message[..], "unary echo byte-equality");
    assert_eq!(trailers.get("grpc-status").unwrap(), "0");
}

#[tokio::test]
async fn second_grpc_call_reuses_the_origin_session() {
    let origin = MockGrpcOrigin::start().await.expect("grpc origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/pkg.Svc/Method").await;

    let stream = tokio::net::TcpStream::connect(edge.addr).await.expect("connect edge");
    let (mut send, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .expect("h2 handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    for i in 0..3u8 {
        let message = vec![0, 0, 0, 0, 1, i];
        let request = hyper::Request::builder()
            .method("POST")
            .uri(format!("http://{}/pkg.Svc/Method", edge.host()))
            .header("content-type", "application/grpc")
            .header("te", "trailers")
            .body(Full::new(Bytes::from(message.clone())))
            .expect("request");

        let response = send.send_request(request).await.expect("grpc call");
        assert_eq!(response.status(), 200);
        let collected = response.into_body().collect().await.expect("collect");
        let trailers = collected.trailers().cloned().expect("trailers");
        assert_eq!(collected.to_bytes().as_ref(), &message[..]);
        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
    }
}
