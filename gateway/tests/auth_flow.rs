//! Credential carriers and failure envelopes through the full pipeline.

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use llm_gateway::handlers;
use support::{body_json, test_state};
use tower::ServiceExt;

fn models_request() -> axum::http::request::Builder {
    Request::builder().uri("/v1/models").method("GET")
}

#[tokio::test]
async fn missing_credential_is_401_with_envelope() {
    let app = handlers::router(test_state());
    let resp = app
        .oneshot(models_request().body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "authentication_error");
    let body = body_json(resp).await;
    assert_eq!(body["error"]["type"], "authentication_error");
    assert_eq!(body["error"]["code"], 401);
}

#[tokio::test]
async fn master_key_as_bearer_is_accepted() {
    let app = handlers::router(test_state());
    let resp = app
        .oneshot(
            models_request()
                .header("Authorization", "Bearer test-master-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["object"], "list");
}

#[tokio::test]
async fn master_key_via_basic_scheme() {
    let app = handlers::router(test_state());
    let encoded = base64::engine::general_purpose::STANDARD.encode("admin:test-master-key");
    let resp = app
        .oneshot(
            models_request()
                .header("Authorization", format!("Basic {encoded}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn master_key_via_x_api_key_header() {
    let app = handlers::router(test_state());
    let resp = app
        .oneshot(
            models_request()
                .header("X-API-Key", "test-master-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn master_key_via_query_parameter() {
    let app = handlers::router(test_state());
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/v1/models?api_key=test-master-key")
                .method("GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn wrong_master_key_is_rejected() {
    let app = handlers::router(test_state());
    let resp = app
        .oneshot(
            models_request()
                .header("Authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn basic_scheme_never_carries_api_keys() {
    let app = handlers::router(test_state());
    let encoded = base64::engine::general_purpose::STANDARD.encode("user:sk-some-api-key");
    let resp = app
        .oneshot(
            models_request()
                .header("Authorization", format!("Basic {encoded}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn operational_endpoints_skip_auth() {
    let app = handlers::router(test_state());
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method("GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn responses_carry_request_id() {
    let app = handlers::router(test_state());
    let resp = app
        .oneshot(
            models_request()
                .header("Authorization", "Bearer test-master-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(resp.headers().contains_key("X-Request-Id"));
}
