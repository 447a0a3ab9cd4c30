//! End-to-end: a plain GET through edge → agent → origin and back.

mod support;

use support::{start_agent, start_edge, wait_for_agent};
use tunnel_test_utils::MockOrigin;

#[tokio::test]
async fn simple_get_round_trip() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/hello").await;

    let response = reqwest::get(edge.http_url("/hello")).await.expect("request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.content_length(), Some(3));
    assert_eq!(response.text().await.unwrap(), "hi\n");
}

#[tokio::test]
async fn request_headers_reach_the_origin_with_forwarding_info() {
    let origin = MockOrigin::start().await.expect("origin");
    let edge = start_edge().await;
    let _agent = start_agent(&edge, origin.port(), "").await;
    wait_for_agent(&edge, "/headers").await;

    let client = reqwest::Client::new();
    let body = client
        .get(edge.http_url("/headers"))
        .header("x-custom-marker", "tunnel-e2e")
        .send()
        .await
        .expect("request")
        .text()
        .await
        .unwrap();

    assert!(body.contains("x-custom-marker: tunnel-e2e"), "custom header passthrough:\n{}", body);
    assert!(body.contains("x-forwarded-for: 127.0.0.1"), "x-forwarded-for:\n{}", body);
    assert!(body.contains("x-forwarded-proto: http"), "x-forwarded-proto:\n{}", body);
    assert!(body.contains("x-forwarded-port: 80"), "x-forwarded-port:\n{}", body);
    assert!(
        body.contains(&format!("x-forwarded-host: {}", edge.host())),
        "x-forwarded-host:\n{}",
        body
    );
}

#[tokio::test]
async fn token_issuer_signs_verifiable_tokens() {
    let edge = start_edge().await;

    let token = reqwest::get(edge.http_url(
        "/tunnel_jwt_generator?username=issuer&password=issuer-pass",
    ))
    .await
    .expect("request")
    .error_for_status()
    .expect("issuer enabled")
    .text()
    .await
    .unwrap();
    assert!(edge::auth::verify_token(support::SECRET_KEY, support::VERIFY_TOKEN, &token));

    let response = reqwest::get(edge.http_url(
        "/tunnel_jwt_generator?username=issuer&password=wrong",
    ))
    .await
    .expect("request");
    assert_eq!(response.status(), 401);
    assert_eq!(response.text().await.unwrap(), "Forbidden");
}

#[tokio::test]
async fn unrouted_host_is_a_404() {
    let edge = start_edge().await;

    let response = reqwest::get(edge.http_url("/hello")).await.expect("request");
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "Not Found");
}
