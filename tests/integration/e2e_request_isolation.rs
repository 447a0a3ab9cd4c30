//! End-to-end: concurrent requests on one control channel stay isolated;
//! cancelling one changes nothing for the others.

mod support;

use bytes::Bytes;
use futures_util::StreamExt;
use support::{start_agent, start_edge, wait_for_agent};
use tunnel_test_utils::MockOrigin;

fn distinct_payload(index: usize) -> Bytes {
    let mut payload = vec![0u8; 64 * 1024];
    for (offset, byte) in payload.iter_mut().enumerate() {
        *byte = ((index * 97 + offset * 13) % 256) as u8;
    }
    Bytes::from(payload)
}

#[tokio::test]
async fn concurrent_echoes_do_not_bleed_into_each_other() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/echo").await;

    let client = reqwest::Client::new();
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let client = client.clone();
            let url = edge.http_url("/echo");
            let payload = distinct_payload(i);
            tokio::spawn(async move {
                let echoed = client
                    .post(url)
                    .body(payload.clone())
                    .send()
                    .await
                    .expect("request")
                    .bytes()
                    .await
                    .expect("body");
                (payload, echoed)
            })
        })
        .collect();

    for task in tasks {
        let (sent, echoed) = task.await.expect("task");
        assert_eq!(echoed, sent, "each request must receive exactly its own bytes");
    }
}

#[tokio::test]
async fn cancelling_one_request_leaves_the_rest_intact() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/stream").await;

    let client = reqwest::Client::new();

    // A long-running stream we abandon mid-flight.
    let response = client
        .get(edge.http_url("/stream"))
        .send()
        .await
        .expect("stream request");
    let mut stream = response.bytes_stream();
    let _ = stream.next().await.expect("first chunk").expect("chunk");
    drop(stream); // client abort → request-error toward the agent

    // Requests before, during, and after the cancellation all round-trip.
    for i in 0..3 {
        let payload = distinct_payload(i + 100);
        let echoed = client
            .post(edge.http_url("/echo"))
            .body(payload.clone())
            .send()
            .await
            .expect("request")
            .bytes()
            .await
            .expect("body");
        assert_eq!(echoed, payload);
    }
}
