//! Budget enforcement around the dispatch path: the pre-flight estimate
//! denies with 402, a smaller request on the same key passes.

mod support;

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Extension, Router};
use llm_gateway::app_state::{AuthContext, RequestInfo};
use llm_gateway::budget::BudgetScope;
use llm_gateway::config::RoutingStrategy;
use llm_gateway::handlers::openai::chat_completions;
use llm_gateway::keys::{hash_api_key, KeyRecord, KeyType};
use llm_gateway::validator::Credential;
use serde_json::json;
use support::{body_json, registry_with_instances, test_state, FakeProvider};
use tower::ServiceExt;
use uuid::Uuid;

fn api_key_context(key_id: Uuid) -> AuthContext {
    let mut key = KeyRecord::master();
    key.id = key_id;
    key.key_type = KeyType::Api;
    key.key_hash = hash_api_key("sk-test-key");
    key.user_id = None;
    key.scopes = Vec::new();
    AuthContext {
        credential: Credential::ApiKey(key),
    }
}

fn request_info() -> RequestInfo {
    RequestInfo {
        request_id: Uuid::new_v4(),
        client_ip: None,
        user_agent: None,
    }
}

/// Chat route with a synthetic API-key principal, skipping the outer auth
/// middleware so no database is involved.
fn chat_app(state: llm_gateway::app_state::AppState, key_id: Uuid) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .layer(Extension(api_key_context(key_id)))
        .layer(Extension(request_info()))
        .with_state(state)
}

fn chat_request(max_tokens: u64) -> Request<Body> {
    Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": "gpt-4", "messages": [], "max_tokens": max_tokens}).to_string(),
        ))
        .unwrap()
}

fn priced_state() -> llm_gateway::app_state::AppState {
    let mut state = test_state();
    let provider = FakeProvider::ok(json!({
        "id": "chatcmpl-1",
        "usage": {"prompt_tokens": 2, "completion_tokens": 2},
    }));
    // Output tokens cost 0.001 each; input is free so the estimate is
    // exactly max_tokens * 0.001.
    let config: llm_gateway::config::ModelInstanceConfig = serde_json::from_value(json!({
        "id": "gpt4-a",
        "model": "gpt-4",
        "provider": "openai",
        "input_cost_per_token": 0.0,
        "output_cost_per_token": 0.001,
    }))
    .unwrap();
    state.registry = registry_with_instances(
        RoutingStrategy::Priority,
        HashMap::new(),
        vec![(config, provider)],
        3,
        Duration::from_secs(30),
    );
    state
}

#[tokio::test]
async fn near_exhausted_budget_denies_then_admits_smaller_request() {
    let state = priced_state();
    let key_id = Uuid::new_v4();
    // maxBudget 10, currentSpend 9.99: 0.01 remaining.
    state
        .budgets
        .refresh(&BudgetScope::Key(key_id), Some(10.0), 9.99)
        .await;
    let app = chat_app(state, key_id);

    // Estimated cost 0.05 would overdraw.
    let resp = app.clone().oneshot(chat_request(50)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["type"], "budget_error");

    // Estimated cost 0.005 fits in the remaining 0.01.
    let resp = app.oneshot(chat_request(5)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_budget_scope_fails_open() {
    let state = priced_state();
    let app = chat_app(state, Uuid::new_v4());
    let resp = app.oneshot(chat_request(50)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn key_model_restriction_is_enforced_at_call_time() {
    let state = priced_state();
    let key_id = Uuid::new_v4();
    let mut key = KeyRecord::master();
    key.id = key_id;
    key.key_type = KeyType::Api;
    key.blocked_models = vec!["gpt-4".to_string()];
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .layer(Extension(AuthContext {
            credential: Credential::ApiKey(key),
        }))
        .layer(Extension(request_info()))
        .with_state(state);

    let resp = app.oneshot(chat_request(5)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["type"], "access_error");
}
