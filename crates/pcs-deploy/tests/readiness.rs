//! Integration tests for the website readiness prober.

use std::time::Duration;

use pcs_common::retry::RetryConfig;
use pcs_common::MAX_RETRY;
use pcs_deploy::readiness::ReadinessProber;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn prober() -> ReadinessProber {
    ReadinessProber::new()
        .unwrap()
        .with_retry(RetryConfig::fixed(Duration::ZERO, MAX_RETRY))
}

#[tokio::test]
async fn test_ready_on_last_attempt() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ssl-proxy-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Status": "Initializing"})))
        .up_to_n_times(MAX_RETRY as u64 - 1)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/ssl-proxy-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Status": "Alive"})))
        .mount(&server)
        .await;

    assert!(prober().wait_until_ready(&server.uri()).await);
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        MAX_RETRY as usize
    );
}

#[tokio::test]
async fn test_never_alive_gives_up_after_budget() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ssl-proxy-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Status": "Initializing"})))
        .mount(&server)
        .await;

    assert!(!prober().wait_until_ready(&server.uri()).await);
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        MAX_RETRY as usize
    );
}

#[tokio::test]
async fn test_non_json_responses_count_as_not_ready() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ssl-proxy-status"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>Bad Gateway</html>"))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/ssl-proxy-status"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"Status": "Alive since 10:00"})),
        )
        .mount(&server)
        .await;

    assert!(prober().wait_until_ready(&format!("{}/", server.uri())).await);
}
