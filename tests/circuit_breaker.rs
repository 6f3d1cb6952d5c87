mod common;

use std::sync::atomic::Ordering;

use common::{spawn_gateway, spawn_mock_upstream, test_config};
use reqwest::Client;
use serde_json::json;

const ORIGIN: &str = "https://shop.example";

fn generation_body() -> serde_json::Value {
    json!({
        "prompt": "A bouquet of red roses in soft morning light",
        "model": "flux"
    })
}

#[tokio::test]
async fn opens_after_consecutive_failures_and_short_circuits() {
    let (upstream, mock, _uh) = spawn_mock_upstream().await;
    mock.fail_first.store(100, Ordering::SeqCst);
    let mut config = test_config(&upstream);
    config.rate.per_minute = 100;
    let (gateway, _gh) = spawn_gateway(config).await;
    let client = Client::new();
    let url = format!("{}/generate-image", gateway);

    // Five consecutive failures reach the threshold and open the breaker.
    for _ in 0..5 {
        let resp = client
            .post(&url)
            .header("Origin", ORIGIN)
            .json(&generation_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
    }
    assert_eq!(mock.hits.load(Ordering::SeqCst), 5);

    // The sixth request never reaches the upstream.
    let resp = client
        .post(&url)
        .header("Origin", ORIGIN)
        .json(&generation_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"],
        json!("Circuit breaker open: API temporarily unavailable")
    );
    assert_eq!(mock.hits.load(Ordering::SeqCst), 5);

    let health: serde_json::Value = client
        .get(format!("{}/healthz", gateway))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["breaker"], json!("open"));
}

#[tokio::test]
async fn recovers_through_half_open_after_the_reset_timeout() {
    let (upstream, mock, _uh) = spawn_mock_upstream().await;
    mock.fail_first.store(5, Ordering::SeqCst);
    let mut config = test_config(&upstream);
    config.rate.per_minute = 100;
    config.breaker_reset_ms = 100;
    let (gateway, _gh) = spawn_gateway(config).await;
    let client = Client::new();
    let url = format!("{}/generate-image", gateway);

    for _ in 0..5 {
        let resp = client
            .post(&url)
            .header("Origin", ORIGIN)
            .json(&generation_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
    }

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    // The upstream has recovered; the probe succeeds and closes the breaker.
    let resp = client
        .post(&url)
        .header("Origin", ORIGIN)
        .json(&generation_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let health: serde_json::Value = client
        .get(format!("{}/healthz", gateway))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["breaker"], json!("closed"));
}

#[tokio::test]
async fn a_failed_probe_reopens_immediately() {
    let (upstream, mock, _uh) = spawn_mock_upstream().await;
    mock.fail_first.store(100, Ordering::SeqCst);
    let mut config = test_config(&upstream);
    config.rate.per_minute = 100;
    config.breaker_reset_ms = 100;
    let (gateway, _gh) = spawn_gateway(config).await;
    let client = Client::new();
    let url = format!("{}/generate-image", gateway);

    for _ in 0..5 {
        client
            .post(&url)
            .header("Origin", ORIGIN)
            .json(&generation_body())
            .send()
            .await
            .unwrap();
    }
    assert_eq!(mock.hits.load(Ordering::SeqCst), 5);

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    // Half-open probe fails and snaps the breaker back open.
    let probe = client
        .post(&url)
        .header("Origin", ORIGIN)
        .json(&generation_body())
        .send()
        .await
        .unwrap();
    assert_eq!(probe.status(), 500);
    assert_eq!(mock.hits.load(Ordering::SeqCst), 6);

    let blocked = client
        .post(&url)
        .header("Origin", ORIGIN)
        .json(&generation_body())
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), 503);
    assert_eq!(mock.hits.load(Ordering::SeqCst), 6);
}
