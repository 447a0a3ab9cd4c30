//! End-to-end: longest-prefix routing picks the right agent per path.

mod support;

use support::{start_agent, start_edge, wait_for_agents};
use tunnel_test_utils::MockOrigin;

#[tokio::test]
async fn longest_prefix_beats_the_wildcard() {
    let root_origin = MockOrigin::start_named("root-origin").await.expect("origin");
    let api_origin = MockOrigin::start_named("api-origin").await.expect("origin");

    let edge = start_edge().await;
    let _wildcard_agent = start_agent(&edge, root_origin.port(), "").await;
    let _api_agent = start_agent(&edge, api_origin.port(), "/api_v1").await;
    wait_for_agents(&edge, 2).await;

    let body = reqwest::get(edge.http_url("/api_v1/x"))
        .await
        .expect("request")
        .text()
        .await
        .unwrap();
    assert_eq!(body, "api-origin");

    let body = reqwest::get(edge.http_url("/other"))
        .await
        .expect("request")
        .text()
        .await
        .unwrap();
    assert_eq!(body, "root-origin");
}

#[tokio::test]
async fn prefix_only_host_misses_other_paths() {
    let api_origin = MockOrigin::start_named("api-origin").await.expect("origin");

    let edge = start_edge().await;
    let _api_agent = start_agent(&edge, api_origin.port(), "/api_v1").await;
    wait_for_agents(&edge, 1).await;

    let hit = reqwest::get(edge.http_url("/api_v1/users"))
        .await
        .expect("request");
    assert_eq!(hit.status(), 200);
    assert_eq!(hit.text().await.unwrap(), "api-origin");

    // No wildcard registered: everything outside the prefix is a miss.
    let miss = reqwest::get(edge.http_url("/elsewhere")).await.expect("request");
    assert_eq!(miss.status(), 404);
}
