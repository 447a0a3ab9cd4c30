//! End-to-end: handshake rejections. Duplicate `(host, prefix)` keys and
//! bad tokens both close the control socket with the contract's messages.

mod support;

use futures_util::StreamExt;
use support::{agent_token, start_agent, start_edge, wait_for_agent};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tunnel_protocol::handshake;
use tunnel_test_utils::MockOrigin;

/// Connect to the control endpoint the way an agent would and return the
/// close reason the edge answered with.
async fn handshake_close_reason(edge_ws_url: &str, token: &str, path_prefix: &str) -> String {
    let mut request = format!("{}{}", edge_ws_url, handshake::CONTROL_PATH)
        .into_client_request()
        .expect("ws request");
    let headers = request.headers_mut();
    headers.insert("Authorization", format!("Bearer {}", token).parse().unwrap());
    headers.insert(handshake::PATH_PREFIX_HEADER, path_prefix.parse().unwrap());
    headers.insert(handshake::SUPPORTS_HTTP2_HEADER, "true".parse().unwrap());

    let (mut ws, _response) = connect_async(request).await.expect("ws connect");
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => return frame.reason.to_string(),
            Some(Ok(Message::Close(None))) | None => return String::new(),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("ws error instead of close frame: {}", e),
        }
    }
}

#[tokio::test]
async fn duplicate_key_is_refused_and_the_original_keeps_serving() {
    let origin = MockOrigin::start_named("first-agent").await.expect("origin");
    let edge = start_edge().await;
    let _first = start_agent(&edge, origin.port(), "/p").await;
    wait_for_agent(&edge, "/p/x").await;

    let reason = handshake_close_reason(&edge.ws_url(""), &agent_token(), "/p").await;
    assert_eq!(reason, format!("{} has a existing connection", edge.host()));

    // The original registration keeps serving.
    let response = reqwest::get(edge.http_url("/p/anything")).await.expect("request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "first-agent");
}

#[tokio::test]
async fn invalid_token_is_rejected_with_authentication_error() {
    let edge = start_edge().await;

    let reason = handshake_close_reason(&edge.ws_url(""), "not-a-valid-token", "").await;
    assert_eq!(reason, "Authentication error");

    // Nothing was registered.
    assert_eq!(edge.state.registry.len().await, 0);
}

#[tokio::test]
async fn same_host_different_prefixes_coexist() {
    let origin_a = MockOrigin::start_named("agent-a").await.expect("origin");
    let origin_b = MockOrigin::start_named("agent-b").await.expect("origin");
    let edge = start_edge().await;

    let _a = start_agent(&edge, origin_a.port(), "/a").await;
    let _b = start_agent(&edge, origin_b.port(), "/b").await;
    support::wait_for_agents(&edge, 2).await;

    assert_eq!(
        reqwest::get(edge.http_url("/a/1")).await.unwrap().text().await.unwrap(),
        "agent-a"
    );
    assert_eq!(
        reqwest::get(edge.http_url("/b/1")).await.unwrap().text().await.unwrap(),
        "agent-b"
    );
}
