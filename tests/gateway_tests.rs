/// End-to-end tests of the router with the in-memory cache and a mocked auth service
mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    response::Response,
};
use lake_gateway::server::create_router;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_healthcheck() {
    let auth = common::setup_auth_mock().await;
    let (state, _) = common::test_state(common::test_config(&auth.uri())).await;
    let app = create_router(state, None);

    let request = Request::builder()
        .uri("/v1/healthcheck")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-stan-id").is_some());
    assert_eq!(body_json(response).await, json!({"health": true}));
}

#[tokio::test]
async fn test_stan_is_echoed() {
    let auth = common::setup_auth_mock().await;
    let (state, _) = common::test_state(common::test_config(&auth.uri())).await;
    let app = create_router(state, None);

    let request = Request::builder()
        .uri("/v1/healthcheck")
        .header("x-request-id", "trace-123")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.headers().get("x-stan-id").unwrap(), "trace-123");
}

#[tokio::test]
async fn test_authenticate_forwards_to_auth_service() {
    let auth = common::setup_auth_mock().await;
    let (state, _) = common::test_state(common::test_config(&auth.uri())).await;
    let app = create_router(state, None);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/authenticate")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"username":"ann","password":"pw"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"token": "good", "expires_in": 300})
    );
}

#[tokio::test]
async fn test_authenticate_rejected_credentials() {
    let auth = common::setup_auth_mock().await;
    let (state, _) = common::test_state(common::test_config(&auth.uri())).await;
    let app = create_router(state, None);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/authenticate")
        .body(Body::from(r#"{"username":"ann","password":"wrong"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "upstream_error");
}

#[tokio::test]
async fn test_authenticate_malformed_body() {
    let auth = common::setup_auth_mock().await;
    let (state, _) = common::test_state(common::test_config(&auth.uri())).await;
    let app = create_router(state, None);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/authenticate")
        .body(Body::from("not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["type"], "bad_request");
}

#[tokio::test]
async fn test_bearer_token_is_cached() {
    let auth = common::setup_auth_mock().await;
    let (state, store) = common::test_state(common::test_config(&auth.uri())).await;
    let app = create_router(state, None);

    let request = Request::builder()
        .uri("/v1/healthcheck")
        .header("authorization", "Bearer good")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_invalid_bearer_token() {
    let auth = common::setup_auth_mock().await;
    let (state, store) = common::test_state(common::test_config(&auth.uri())).await;
    let app = create_router(state, None);

    let request = Request::builder()
        .uri("/v1/healthcheck")
        .header("authorization", "Bearer stolen")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_access_log_enabled() {
    let auth = common::setup_auth_mock().await;
    let mut config = common::test_config(&auth.uri());
    config.access_log.enabled = true;
    let (state, _) = common::test_state(config).await;
    let app = create_router(state, None);

    let request = Request::builder()
        .uri("/v1/healthcheck")
        .header("authorization", "Bearer good")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
