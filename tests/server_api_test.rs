//! HTTP surface tests over a real listener: health, auth, rate
//! limiting, bounded reads, and metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use aragora::config::AragoraConfig;
use aragora::engine::Engine;
use aragora::server::build_router;
use aragora::store::SqliteStore;

fn engine_with(config: AragoraConfig) -> Arc<Engine> {
    let store = SqliteStore::open_in_memory().unwrap().shared();
    Engine::with_store(config, store).unwrap()
}

async fn serve(engine: Arc<Engine>) -> SocketAddr {
    let router = build_router(engine);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_reports_components_and_version() {
    let addr = serve(engine_with(AragoraConfig::from_env())).await;
    let body: serde_json::Value = reqwest::get(format!("http://{addr}/api/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["components"]["storage"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_debate_is_machine_readable_404() {
    let addr = serve(engine_with(AragoraConfig::from_env())).await;
    let response = reqwest::get(format!("http://{addr}/api/debates/no-such-slug"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rate_limit_returns_retry_after() {
    let mut config = AragoraConfig::from_env();
    config.ip_rate_limit_per_minute = 3;
    let addr = serve(engine_with(config)).await;

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let response = client
            .get(format!("http://{addr}/api/debates"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    let response = client
        .get(format!("http://{addr}/api/debates"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("retry-after hint");
    assert!(retry_after >= 1);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "rate_limited");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_required_when_key_configured() {
    let mut config = AragoraConfig::from_env();
    config.auth_hmac_key = Some("integration-test-signing-key".to_string());
    let engine = engine_with(config);
    let token = engine.auth.issue("tester").unwrap();
    let addr = serve(engine).await;

    let client = reqwest::Client::new();
    let denied = client
        .get(format!("http://{addr}/api/leaderboard"))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    let via_header = client
        .get(format!("http://{addr}/api/leaderboard"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(via_header.status(), 200);

    // The token also works as a query parameter.
    let via_query = client
        .get(format!("http://{addr}/api/leaderboard?token={token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(via_query.status(), 200);

    let garbage = client
        .get(format!("http://{addr}/api/leaderboard"))
        .bearer_auth("forged.token.value")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), 401);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_debate_validates_input() {
    let addr = serve(engine_with(AragoraConfig::from_env())).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/api/debates"))
        .json(&serde_json::json!({"task": "", "agents": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_list_debates_enforces_limit_bounds() {
    let addr = serve(engine_with(AragoraConfig::from_env())).await;
    let body: serde_json::Value =
        reqwest::get(format!("http://{addr}/api/debates?limit=999999"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert!(body["debates"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metrics_endpoint_serves_prometheus_text() {
    let addr = serve(engine_with(AragoraConfig::from_env())).await;
    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("aragora_"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consistency_endpoint_for_unknown_agent() {
    let addr = serve(engine_with(AragoraConfig::from_env())).await;
    let body: serde_json::Value =
        reqwest::get(format!("http://{addr}/api/agent/nobody/consistency"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    // A fresh agent has no positions and perfect consistency.
    assert_eq!(body["consistency"]["consistency"], 1.0);
    assert_eq!(body["consistency"]["total_positions"], 0);
}
