//! HTTP surface tests — served over a real listener, driven with reqwest.
#![cfg(feature = "web-api")]

use async_trait::async_trait;
use llm_substrate::cache::CacheAdapter;
use llm_substrate::client::{InvocationRequest, LlmClient};
use llm_substrate::moderation::ModerationService;
use llm_substrate::rate_limit::{RateLimitPolicy, RateLimiter};
use llm_substrate::routing::{BackendProfile, CapabilityTier, ModelRouter, StatsProjector};
use llm_substrate::telemetry::TelemetryStore;
use llm_substrate::web_api::{app, AppState};
use llm_substrate::SubstrateError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

struct CannedClient;

#[async_trait]
impl LlmClient for CannedClient {
    async fn invoke(
        &self,
        _backend: &str,
        _request: InvocationRequest,
    ) -> Result<String, SubstrateError> {
        Ok(r#"{"language":"English","language_code":"en","severity":"safe",
             "categories":[],"confidence":0.99,"risk_score":1,"flagged":false,
             "reasoning":"fine"}"#
            .to_string())
    }

    async fn invoke_stream(
        &self,
        _backend: &str,
        _request: InvocationRequest,
    ) -> Result<mpsc::Receiver<String>, SubstrateError> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send("{\"severity\":".to_string()).await;
            let _ = tx.send("\"safe\"}".to_string()).await;
        });
        Ok(rx)
    }
}

async fn serve(rate_limit: u32) -> SocketAddr {
    let profiles = vec![BackendProfile {
        name: "moderator-model".into(),
        tier: CapabilityTier::Basic,
        cost_per_1k_tokens: 0.001,
        nominal_max_latency_ms: 500,
        supports_structured_output: true,
        supports_streaming: true,
    }];
    let telemetry = Arc::new(TelemetryStore::in_memory(&profiles));
    let router = Arc::new(ModelRouter::new(profiles, telemetry.clone(), "moderator-model").unwrap());
    let cache = Arc::new(CacheAdapter::new_memory());
    let limiter = Arc::new(RateLimiter::new(
        cache.clone(),
        RateLimitPolicy {
            max_requests: rate_limit,
            window_secs: 60,
        },
    ));
    let service = Arc::new(ModerationService::new(
        Arc::new(CannedClient),
        router,
        cache,
        limiter,
    ));
    let state = Arc::new(AppState {
        service,
        telemetry,
        projector: StatsProjector::default(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

#[tokio::test]
async fn test_post_moderation_returns_result_with_cached_flag() {
    let addr = serve(100).await;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("http://{addr}/moderation"))
        .json(&serde_json::json!({ "message": "hello there", "locale": "en" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["severity"], "safe");
    assert_eq!(body["cached"], false);
    assert!(body["metrics"]["total_requests"].is_number());

    // Same message again: cache hit
    let resp = http
        .post(format!("http://{addr}/moderation"))
        .json(&serde_json::json!({ "message": "hello there", "locale": "en" }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["cached"], true);
}

#[tokio::test]
async fn test_post_moderation_missing_message_is_400() {
    let addr = serve(100).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/moderation"))
        .json(&serde_json::json!({ "locale": "en" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn test_rate_limited_post_gets_429_and_headers() {
    let addr = serve(1).await;
    let http = reqwest::Client::new();
    let url = format!("http://{addr}/moderation");

    let first = http
        .post(&url)
        .json(&serde_json::json!({ "message": "one" }))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = http
        .post(&url)
        .json(&serde_json::json!({ "message": "two" }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 429);
    assert!(second.headers().contains_key("retry-after"));
    assert_eq!(second.headers()["x-ratelimit-limit"], "1");
    assert_eq!(second.headers()["x-ratelimit-remaining"], "0");
    assert!(second.headers().contains_key("x-ratelimit-reset"));
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["error"], "rate_limited");
    assert!(body["retryAfter"].is_number());
}

#[tokio::test]
async fn test_streaming_post_returns_incremental_text() {
    let addr = serve(100).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/moderation"))
        .json(&serde_json::json!({ "message": "stream me", "stream": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = resp.text().await.unwrap();
    assert_eq!(body, "{\"severity\":\"safe\"}");
}

#[tokio::test]
async fn test_get_moderation_exposes_metrics_and_cache_stats() {
    let addr = serve(100).await;
    let http = reqwest::Client::new();

    http.post(format!("http://{addr}/moderation"))
        .json(&serde_json::json!({ "message": "warm up" }))
        .send()
        .await
        .unwrap();

    let resp = http
        .get(format!("http://{addr}/moderation"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["metrics"]["total_requests"], 1);
    assert_eq!(body["cache"]["type"], "memory");
    assert!(body["cache"]["size"].is_number());
}

#[tokio::test]
async fn test_get_router_stats_has_report_shape() {
    let addr = serve(100).await;
    let http = reqwest::Client::new();

    http.post(format!("http://{addr}/moderation"))
        .json(&serde_json::json!({ "message": "drive one decision" }))
        .send()
        .await
        .unwrap();

    let resp = http
        .get(format!("http://{addr}/model-router/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["summary"]["total_decisions"], 1);
    assert_eq!(body["model_usage"]["moderator-model"], 1);
    assert!(body["cost_analysis"]["assumed_tokens_per_call"].is_number());
    assert!(body["comparison"].is_array());
}
