//! The determinism gate: only `stream=false, temperature=0` requests are
//! served from or written to the response cache.

mod support;

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use llm_gateway::config::RoutingStrategy;
use llm_gateway::handlers;
use serde_json::json;
use support::{body_json, instance_config, registry_with_instances, test_state, FakeProvider};
use tower::ServiceExt;

fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("content-type", "application/json")
        .header("Authorization", "Bearer test-master-key")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn state_with_fake_model() -> llm_gateway::app_state::AppState {
    let mut state = test_state();
    let provider = FakeProvider::ok(json!({
        "id": "chatcmpl-1",
        "choices": [{"message": {"role": "assistant", "content": "hello"}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5},
    }));
    state.registry = registry_with_instances(
        RoutingStrategy::Priority,
        HashMap::new(),
        vec![(instance_config("gpt4-a", "gpt-4"), provider)],
        3,
        Duration::from_secs(30),
    );
    state
}

#[tokio::test]
async fn deterministic_request_writes_then_hits() {
    let app = handlers::router(state_with_fake_model());

    let body = json!({"model": "gpt-4", "messages": [], "temperature": 0, "stream": false});

    let first = app.clone().oneshot(chat_request(body.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("X-Cache").unwrap(), "MISS");

    let second = app.clone().oneshot(chat_request(body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("X-Cache").unwrap(), "HIT");
    assert!(second.headers().contains_key("Age"));
    let payload = body_json(second).await;
    assert_eq!(payload["id"], "chatcmpl-1");
}

#[tokio::test]
async fn streaming_requests_bypass_the_cache() {
    let app = handlers::router(state_with_fake_model());

    let streaming = json!({"model": "gpt-4", "messages": [], "temperature": 0, "stream": true});
    for _ in 0..2 {
        let resp = app.clone().oneshot(chat_request(streaming.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("X-Cache").is_none());
    }

    // The identical request with stream=false is a fresh MISS, proving the
    // streaming attempts wrote nothing.
    let deterministic =
        json!({"model": "gpt-4", "messages": [], "temperature": 0, "stream": false});
    let resp = app.clone().oneshot(chat_request(deterministic.clone())).await.unwrap();
    assert_eq!(resp.headers().get("X-Cache").unwrap(), "MISS");
    let resp = app.oneshot(chat_request(deterministic)).await.unwrap();
    assert_eq!(resp.headers().get("X-Cache").unwrap(), "HIT");
}

#[tokio::test]
async fn nonzero_temperature_is_never_cached() {
    let app = handlers::router(state_with_fake_model());

    let body = json!({"model": "gpt-4", "messages": [], "temperature": 0.7});
    for _ in 0..2 {
        let resp = app.clone().oneshot(chat_request(body.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("X-Cache").is_none());
    }
}

#[tokio::test]
async fn fingerprint_follows_the_credential_not_the_carrier() {
    let app = handlers::router(state_with_fake_model());
    let body = json!({"model": "gpt-4", "messages": [], "temperature": 0});

    let resp = app.clone().oneshot(chat_request(body.clone())).await.unwrap();
    assert_eq!(resp.headers().get("X-Cache").unwrap(), "MISS");

    // Same credential through a different carrier still hits.
    let other = Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("content-type", "application/json")
        .header("X-API-Key", "test-master-key")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.oneshot(other).await.unwrap();
    assert_eq!(resp.headers().get("X-Cache").unwrap(), "HIT");
}
