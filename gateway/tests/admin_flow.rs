//! Admin surface: internal token issuance, router health view, cache
//! flush, and permission denials for unprivileged credentials.

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Extension, Router};
use common_auth::{JwtConfig, JwtVerifier};
use llm_gateway::app_state::{AuthContext, RequestInfo};
use llm_gateway::handlers;
use llm_gateway::keys::{KeyRecord, KeyType};
use llm_gateway::validator::Credential;
use serde_json::json;
use support::{body_json, test_state};
use tower::ServiceExt;
use uuid::Uuid;

fn master_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header("content-type", "application/json")
        .header("Authorization", "Bearer test-master-key")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn issued_internal_token_verifies_as_hs256() {
    let app = handlers::router(test_state());
    let resp = app
        .oneshot(master_post("/api/auth/token", json!({"ttl_secs": 600})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 600);

    let token = body["access_token"].as_str().unwrap();
    assert!(token.len() <= 500);

    // The token must satisfy the verifier the gateway itself would use.
    let verifier = JwtVerifier::new(
        JwtConfig::new("llm-gateway", "llm-gateway").with_hs256_secret("test-jwt-secret"),
    );
    let claims = verifier.verify(token).await.unwrap();
    assert_eq!(claims.subject, "master");
    assert_eq!(claims.issuer, "llm-gateway");
}

#[tokio::test]
async fn router_health_lists_instances_for_master() {
    let app = handlers::router(test_state());
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/admin/router")
                .method("GET")
                .header("Authorization", "Bearer test-master-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert!(body["instances"].is_array());
}

#[tokio::test]
async fn cache_flush_accepts_known_targets_only() {
    let app = handlers::router(test_state());
    let resp = app
        .clone()
        .oneshot(master_post("/api/admin/cache/flush", json!({"target": "all"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = app
        .oneshot(master_post("/api/admin/cache/flush", json!({"target": "dns"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn plain_api_key_cannot_read_router_health() {
    let state = test_state();
    let mut key = KeyRecord::master();
    key.key_type = KeyType::Api;
    key.scopes = Vec::new();
    let app = Router::new()
        .route(
            "/api/admin/router",
            get(llm_gateway::handlers::admin::router_health),
        )
        .layer(Extension(AuthContext {
            credential: Credential::ApiKey(key),
        }))
        .layer(Extension(RequestInfo {
            request_id: Uuid::new_v4(),
            client_ip: None,
            user_agent: None,
        }))
        .with_state(state);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/admin/router")
                .method("GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["type"], "access_error");
}
