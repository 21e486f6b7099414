//! Integration tests for the event router HTTP surface.
//!
//! Each test boots the full router (normalizer, enricher, rate limiter,
//! dispatcher) on an ephemeral port with an in-process counter store, and
//! drives it over HTTP. The translation provider and the downstream action
//! handler are mocked with wiremock.

use event_router::cache::TranslationCache;
use event_router::config::{Config, LimitSettings, ProviderKind, RateLimitConfig};
use event_router::dispatch::Dispatcher;
use event_router::downstream::ActionClient;
use event_router::ratelimit::{CounterStore, MemoryCounterStore, RateLimiter};
use event_router::server::{build_router, AppState};
use event_router::translation::{Enricher, Provider};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ==================== Test Helpers ====================

/// Create a test config pointing at mocked provider/downstream URLs.
fn create_test_config(provider_url: &str, downstream_url: &str) -> Config {
    Config {
        port: 0,
        api_key: None,
        redis_url: None,
        database_url: None,
        store_timeout_secs: 1,
        provider: ProviderKind::OpenAi,
        openai_api_key: Some("test-openai-key".to_string()),
        openai_model: "gpt-4o-mini".to_string(),
        openai_api_url: provider_url.to_string(),
        libre_api_url: "http://libre.invalid".to_string(),
        libre_api_key: None,
        provider_timeout_secs: 2,
        target_lang: "en".to_string(),
        min_translation_words: 5,
        confidence_threshold: 0.70,
        translation_cache_size: 100,
        rate_limits: RateLimitConfig {
            default: LimitSettings {
                user_limit: 60,
                community_limit: 600,
                window_secs: 3600,
            },
            overrides: HashMap::new(),
            fail_open_sentinel: 999,
        },
        downstream_url: format!("{}/actions", downstream_url),
        downstream_timeout_secs: 2,
        batch_concurrency: 16,
    }
}

/// Boot the router on an ephemeral port; returns its base URL.
async fn spawn_app(config: Config) -> String {
    let client = reqwest::Client::new();
    let cache = Arc::new(TranslationCache::new(config.translation_cache_size));
    let provider = Provider::from_config(&config, client.clone()).expect("provider");
    let enricher = Enricher::new(provider, cache.clone(), &config);
    let limiter = Arc::new(RateLimiter::new(
        Some(CounterStore::Memory(MemoryCounterStore::new())),
        None,
        config.rate_limits.clone(),
        Duration::from_secs(config.store_timeout_secs),
    ));
    let downstream = ActionClient::new(
        client,
        config.downstream_url.clone(),
        Duration::from_secs(config.downstream_timeout_secs),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        enricher,
        limiter.clone(),
        downstream,
        config.batch_concurrency,
    ));

    let state = AppState {
        config: Arc::new(config),
        dispatcher,
        limiter,
        cache,
        pool: None,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });

    format!("http://{}", addr)
}

/// Mount a downstream handler that accepts everything.
async fn mount_accepting_downstream(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/actions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "result_data": {"ack": true}
        })))
        .mount(server)
        .await;
}

/// Mount a provider that detects Spanish and translates to English.
async fn mount_spanish_provider(server: &MockServer) {
    let verdict = json!({
        "detected_lang": "es",
        "confidence": 0.96,
        "translated_text": "Hello, how are you today?",
    });
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": verdict.to_string()}}
            ]
        })))
        .mount(server)
        .await;
}

fn spanish_event() -> serde_json::Value {
    json!({
        "platform": "twitch",
        "channel_id": "c1",
        "user_id": "u1",
        "username": "bob",
        "message": "Hola, ¿cómo estás hoy amigo?"
    })
}

fn short_event(user: &str) -> serde_json::Value {
    json!({
        "platform": "discord",
        "channel_id": "c1",
        "user_id": user,
        "username": user,
        "message": "hey"
    })
}

// ==================== Health ====================

#[tokio::test]
async fn test_health_endpoint() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;

    let body: serde_json::Value = reqwest::get(format!("{}/health", base))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "healthy");
    assert!(body["cache"]["entries"].is_number());
}

// ==================== Single Event ====================

#[tokio::test]
async fn test_spanish_event_translated_end_to_end() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    mount_spanish_provider(&provider).await;
    mount_accepting_downstream(&downstream).await;

    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/router/events", base))
        .json(&spanish_event())
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["success"], true);
    let translation = &body["metadata"]["translation"];
    assert_eq!(translation["detected_lang"], "es");
    assert!(translation["confidence"].as_f64().unwrap() > 0.7);
    assert!(translation["translated_text"]
        .as_str()
        .unwrap()
        .contains("Hello"));
    assert_eq!(translation["cached"], false);
}

#[tokio::test]
async fn test_repeat_spanish_event_served_from_cache() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    mount_spanish_provider(&provider).await;
    mount_accepting_downstream(&downstream).await;

    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/router/events", base);

    let first: serde_json::Value = client
        .post(&url)
        .json(&spanish_event())
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    let second: serde_json::Value = client
        .post(&url)
        .json(&spanish_event())
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(first["metadata"]["translation"]["cached"], false);
    assert_eq!(second["metadata"]["translation"]["cached"], true);
    assert_eq!(
        first["metadata"]["translation"]["translated_text"],
        second["metadata"]["translation"]["translated_text"]
    );
}

#[tokio::test]
async fn test_invalid_event_returns_full_error_list() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/router/events", base))
        .json(&json!({
            "platform": "myspace",
            "channel_id": "",
            "user_id": "u1",
            "username": "   ",
            "message": "hi there everyone today"
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Validation failed");
    let fields: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"platform"));
    assert!(fields.contains(&"channel_id"));
    assert!(fields.contains(&"username"));
}

#[tokio::test]
async fn test_unknown_top_level_field_rejected() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;

    let mut event = short_event("u1");
    event["extra_field"] = json!("nope");
    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/router/events", base))
        .json(&event)
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);
}

// ==================== Batch ====================

#[tokio::test]
async fn test_oversized_batch_rejected_without_downstream_calls() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    // Any downstream call fails the test on mock verification
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(0)
        .mount(&downstream)
        .await;

    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;

    let events: Vec<serde_json::Value> = (0..101).map(|i| short_event(&format!("u{}", i))).collect();
    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/router/events/batch", base))
        .json(&json!({"events": events}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["status"], "error");
    assert_eq!(body["errors"][0]["field"], "events");
}

#[tokio::test]
async fn test_empty_batch_rejected() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/router/events/batch", base))
        .json(&json!({"events": []}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_batch_aggregates_in_submission_order() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    // Slow first user so completion order differs from submission order
    for (user, delay_ms) in [("u0", 200u64), ("u1", 0), ("u2", 0)] {
        Mock::given(method("POST"))
            .and(path("/actions"))
            .and(body_partial_json(json!({"event": {"user_id": user}})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true, "result_data": {"user": user}}))
                    .set_delay(Duration::from_millis(delay_ms)),
            )
            .mount(&downstream)
            .await;
    }

    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;
    let events = vec![short_event("u0"), short_event("u1"), short_event("u2")];

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/api/v1/router/events/batch", base))
        .json(&json!({"events": events}))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["total_count"], 3);
    assert_eq!(body["success_count"], 3);
    assert_eq!(body["failure_count"], 0);
    for (i, result) in body["results"].as_array().unwrap().iter().enumerate() {
        assert_eq!(result["result_data"]["user"], format!("u{}", i));
    }
}

#[tokio::test]
async fn test_batch_with_invalid_item_rejected_before_processing() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(0)
        .mount(&downstream)
        .await;

    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;
    let mut bad = short_event("u1");
    bad["platform"] = json!("friendster");

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/router/events/batch", base))
        .json(&json!({"events": [short_event("u0"), bad]}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["errors"][0]["field"], "events[1].platform");
}

// ==================== Rate Limiting ====================

#[tokio::test]
async fn test_rate_limited_user_gets_structured_denial() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    mount_accepting_downstream(&downstream).await;

    let mut config = create_test_config(&provider.uri(), &downstream.uri());
    config.rate_limits.overrides.insert(
        "message".to_string(),
        LimitSettings {
            user_limit: 2,
            community_limit: 20,
            window_secs: 3600,
        },
    );

    let base = spawn_app(config).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/router/events", base);

    for _ in 0..2 {
        let body: serde_json::Value = client
            .post(&url)
            .json(&short_event("u1"))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(body["success"], true);
    }

    let response = client
        .post(&url)
        .json(&short_event("u1"))
        .send()
        .await
        .expect("request");
    // Denial is a well-formed outcome, not an HTTP error
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "rate limit exceeded");
    assert_eq!(body["rate_limit"]["allowed"], false);
    assert_eq!(body["rate_limit"]["remaining"], 0);
    assert!(body["rate_limit"]["reset_at"].is_string());
}

#[tokio::test]
async fn test_limit_reset_restores_allowance() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    mount_accepting_downstream(&downstream).await;

    let mut config = create_test_config(&provider.uri(), &downstream.uri());
    config.rate_limits.overrides.insert(
        "message".to_string(),
        LimitSettings {
            user_limit: 1,
            community_limit: 10,
            window_secs: 3600,
        },
    );

    let base = spawn_app(config).await;
    let client = reqwest::Client::new();
    let events_url = format!("{}/api/v1/router/events", base);

    let body: serde_json::Value = client
        .post(&events_url)
        .json(&short_event("u1"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["success"], true);

    let body: serde_json::Value = client
        .post(&events_url)
        .json(&short_event("u1"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["error"], "rate limit exceeded");

    let response = client
        .post(format!("{}/api/v1/router/limits/reset", base))
        .json(&json!({"scope": "user", "community_id": "c1", "user_id": "u1"}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = client
        .post(&events_url)
        .json(&short_event("u1"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["success"], true);
}

// ==================== Handler Responses ====================

#[tokio::test]
async fn test_handler_response_accepted_without_database() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/router/responses", base))
        .json(&json!({
            "event_id": "evt-1",
            "response": "report generated",
            "platform": "slack",
            "channel_id": "c1"
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["status"], "success");
}

#[tokio::test]
async fn test_handler_response_with_bad_platform_rejected() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/router/responses", base))
        .json(&json!({
            "event_id": "evt-1",
            "response": "done",
            "platform": "irc",
            "channel_id": "c1"
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);
}

// ==================== Auth ====================

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    mount_accepting_downstream(&downstream).await;

    let mut config = create_test_config(&provider.uri(), &downstream.uri());
    config.api_key = Some("sekrit".to_string());
    let base = spawn_app(config).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/router/events", base);

    let response = client
        .post(&url)
        .json(&short_event("u1"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 401);

    let response = client
        .post(&url)
        .header("x-api-key", "wrong")
        .json(&short_event("u1"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 401);

    let response = client
        .post(&url)
        .header("x-api-key", "sekrit")
        .json(&short_event("u1"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);

    // Health stays open for liveness probes
    let response = reqwest::get(format!("{}/health", base)).await.expect("request");
    assert_eq!(response.status(), 200);
}

// ==================== Degradation ====================

#[tokio::test]
async fn test_provider_outage_does_not_fail_the_event() {
    let provider = MockServer::start().await;
    let downstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&provider)
        .await;
    mount_accepting_downstream(&downstream).await;

    let base = spawn_app(create_test_config(&provider.uri(), &downstream.uri())).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/api/v1/router/events", base))
        .json(&spanish_event())
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    // Event went through untranslated
    assert_eq!(body["success"], true);
    assert!(body["metadata"].get("translation").is_none() || body["metadata"]["translation"].is_null());
}
