//! End-to-end: abrupt agent loss mid-response aborts the public stream and
//! releases the registration.

mod support;

use std::time::Duration;

use futures_util::StreamExt;
use support::{start_agent, start_edge, wait_for_agent, wait_for_agent_gone};
use tunnel_test_utils::MockOrigin;

#[tokio::test]
async fn mid_response_channel_loss_aborts_the_stream() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/stream").await;

    let response = reqwest::get(edge.http_url("/stream")).await.expect("request");
    assert_eq!(response.status(), 200);
    let mut body = response.bytes_stream();

    // The stream is alive before the loss.
    let first = body.next().await.expect("first chunk").expect("chunk ok");
    assert!(first.starts_with(b"chunk-"));

    agent.kill();

    // The response must abort with an error or hard end, never a clean
    // infinite stream.
    let mut aborted = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(5), body.next()).await {
            Ok(Some(Ok(_chunk))) => continue, // buffered remains
            Ok(Some(Err(_)) | None) => {
                aborted = true;
                break;
            }
            Err(_) => break,
        }
    }
    assert!(aborted, "response stream must abort after channel loss");

    // The registration is reaped, so the host stops routing.
    wait_for_agent_gone(&edge, "/stream").await;
    let response = reqwest::get(edge.http_url("/hello")).await.expect("request");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn graceful_shutdown_exits_zero_when_idle() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/hello").await;

    agent.shutdown.send(true).expect("signal shutdown");
    let code = tokio::time::timeout(Duration::from_secs(5), agent.task)
        .await
        .expect("agent should exit promptly")
        .expect("agent task");
    assert_eq!(code, 0);
}
