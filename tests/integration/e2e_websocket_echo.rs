//! End-to-end: a WebSocket upgrade tunneled to the origin and spliced.

mod support;

use futures_util::{SinkExt, StreamExt};
use support::{start_agent, start_edge, wait_for_agent};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tunnel_test_utils::MockOrigin;

#[tokio::test]
async fn websocket_frames_echo_through_the_tunnel() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/ws").await;

    let (mut ws, response) = connect_async(edge.ws_url("/ws")).await.expect("ws connect");
    assert_eq!(response.status(), 101);

    ws.send(Message::Text("ping-text".into())).await.expect("send text");
    match ws.next().await.expect("echo frame").expect("ws read") {
        Message::Text(text) => assert_eq!(text.as_str(), "ping-text"),
        other => panic!("expected text echo, got {:?}", other),
    }

    let payload = vec![0u8, 1, 2, 253, 254, 255];
    ws.send(Message::Binary(payload.clone().into())).await.expect("send binary");
    match ws.next().await.expect("echo frame").expect("ws read") {
        Message::Binary(bytes) => assert_eq!(bytes.as_ref(), &payload[..]),
        other => panic!("expected binary echo, got {:?}", other),
    }

    ws.close(None).await.expect("close");
}

#[tokio::test]
async fn many_frames_survive_one_connection() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/ws").await;

    let (mut ws, _response) = connect_async(edge.ws_url("/ws")).await.expect("ws connect");

    for i in 0..50 {
        let sent = format!("frame-{}", i);
        ws.send(Message::Text(sent.clone().into())).await.expect("send");
        match ws.next().await.expect("echo").expect("read") {
            Message::Text(text) => assert_eq!(text.as_str(), sent),
            other => panic!("expected text echo, got {:?}", other),
        }
    }
}
