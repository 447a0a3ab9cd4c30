//! End-to-end: a chunked 1 MiB upload echoed back byte-for-byte.

mod support;

use bytes::Bytes;
use support::{start_agent, start_edge, wait_for_agent};
use tunnel_test_utils::MockOrigin;

const CHUNK_SIZE: usize = 16 * 1024;
const CHUNK_COUNT: usize = 64; // 1 MiB total

fn patterned_chunk(index: usize) -> Bytes {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    for (offset, byte) in chunk.iter_mut().enumerate() {
        *byte = ((index * 31 + offset) % 251) as u8;
    }
    Bytes::from(chunk)
}

#[tokio::test]
async fn streamed_upload_echoes_byte_for_byte() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/upload").await;

    let sent: Vec<Bytes> = (0..CHUNK_COUNT).map(patterned_chunk).collect();
    let expected: Vec<u8> = sent.iter().flat_map(|c| c.iter().copied()).collect();

    let stream = futures_util::stream::iter(
        sent.into_iter().map(Ok::<_, std::convert::Infallible>),
    );
    let client = reqwest::Client::new();
    let response = client
        .post(edge.http_url("/upload"))
        .body(reqwest::Body::wrap_stream(stream))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 200);
    let echoed = response.bytes().await.unwrap();
    assert_eq!(echoed.len(), CHUNK_COUNT * CHUNK_SIZE);
    assert_eq!(&echoed[..], &expected[..], "echoed bytes must equal sent bytes");
}

#[tokio::test]
async fn empty_body_round_trips() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/echo").await;

    let client = reqwest::Client::new();
    let response = client
        .post(edge.http_url("/echo"))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 200);
    assert!(response.bytes().await.unwrap().is_empty());
}
