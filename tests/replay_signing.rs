mod common;

use common::{spawn_gateway, spawn_mock_upstream, test_config};
use reqwest::Client;
use serde_json::json;

const ORIGIN: &str = "https://shop.example";
const SECRET: &str = "test-signing-secret";

fn signed_body(secret: &str, nonce: &str, timestamp: i64) -> serde_json::Value {
    let request = bloomgate::GenerateRequest {
        prompt: Some("A bouquet of red roses in soft morning light".into()),
        width: Some(serde_json::Number::from(512)),
        height: Some(serde_json::Number::from(768)),
        model: Some("flux".into()),
        ..bloomgate::GenerateRequest::default()
    };
    let signature = bloomgate::signing::sign(secret, &request, timestamp, nonce);
    json!({
        "prompt": request.prompt,
        "width": 512,
        "height": 768,
        "model": "flux",
        "timestamp": timestamp,
        "nonce": nonce,
        "signature": signature,
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn signing_gateway() -> (String, tokio::task::JoinHandle<()>) {
    let (upstream, _mock, _handle) = spawn_mock_upstream().await;
    let mut config = test_config(&upstream);
    config.signing_secret = Some(SECRET.into());
    spawn_gateway(config).await
}

#[tokio::test]
async fn accepts_a_signed_request_and_rejects_its_replay() {
    let (gateway, _gh) = signing_gateway().await;
    let client = Client::new();
    let url = format!("{}/generate-image", gateway);
    let body = signed_body(SECRET, "nonce-replay-check", now_ms());

    let first = client
        .post(&url)
        .header("Origin", ORIGIN)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let replay = client
        .post(&url)
        .header("Origin", ORIGIN)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), 401);
    let replay_body: serde_json::Value = replay.json().await.unwrap();
    assert_eq!(
        replay_body["error"],
        json!("Replay attack detected: nonce already used")
    );
}

#[tokio::test]
async fn rejects_missing_signing_material() {
    let (gateway, _gh) = signing_gateway().await;

    let resp = Client::new()
        .post(format!("{}/generate-image", gateway))
        .header("Origin", ORIGIN)
        .json(&json!({
            "prompt": "A bouquet of red roses in soft morning light",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], json!("Invalid request signature"));
}

#[tokio::test]
async fn rejects_a_tampered_body() {
    let (gateway, _gh) = signing_gateway().await;
    let mut body = signed_body(SECRET, "nonce-tamper-check", now_ms());
    body["prompt"] = json!("A completely different prompt after signing");

    let resp = Client::new()
        .post(format!("{}/generate-image", gateway))
        .header("Origin", ORIGIN)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let resp_body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(resp_body["error"], json!("Invalid request signature"));
}

#[tokio::test]
async fn rejects_a_signature_from_the_wrong_secret() {
    let (gateway, _gh) = signing_gateway().await;
    let body = signed_body("some-other-secret", "nonce-wrong-secret", now_ms());

    let resp = Client::new()
        .post(format!("{}/generate-image", gateway))
        .header("Origin", ORIGIN)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn rejects_a_stale_timestamp() {
    let (gateway, _gh) = signing_gateway().await;
    // Well past the five minute tolerance.
    let body = signed_body(SECRET, "nonce-stale-check", now_ms() - 600_000);

    let resp = Client::new()
        .post(format!("{}/generate-image", gateway))
        .header("Origin", ORIGIN)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let resp_body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(resp_body["error"], json!("Invalid request signature"));
}

#[tokio::test]
async fn accepts_signing_material_from_headers() {
    let (gateway, _gh) = signing_gateway().await;
    let timestamp = now_ms();
    let nonce = "nonce-header-material";
    let request = bloomgate::GenerateRequest {
        prompt: Some("A bouquet of red roses in soft morning light".into()),
        model: Some("flux".into()),
        ..bloomgate::GenerateRequest::default()
    };
    let signature = bloomgate::signing::sign(SECRET, &request, timestamp, nonce);

    let resp = Client::new()
        .post(format!("{}/generate-image", gateway))
        .header("Origin", ORIGIN)
        .header("X-Timestamp", timestamp.to_string())
        .header("X-Nonce", nonce)
        .header("X-Signature", signature)
        .json(&json!({
            "prompt": "A bouquet of red roses in soft morning light",
            "model": "flux",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}
