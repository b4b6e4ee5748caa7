use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use quota_throttler::{create_app, ThrottleConfig, ThrottlePolicy};
use serde_json::Value;
use tower::ServiceExt;

fn app(per_day: u64) -> Router {
    let config = ThrottleConfig::new("api-rule")
        .with_per_day(per_day)
        .with_persistent(false);
    create_app(Arc::new(ThrottlePolicy::new(config).unwrap()))
}

async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, body)
}

#[tokio::test]
async fn test_reserve_until_quota() {
    let app = app(2);

    let (status, body) = send(&app, Method::POST, "/quota/device-1/reserve").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);
    assert_eq!(body["rule_id"], "api-rule");

    let (status, _) = send(&app, Method::POST, "/quota/device-1/reserve").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, Method::POST, "/quota/device-1/reserve").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["allowed"], false);
}

#[tokio::test]
async fn test_approve_then_use() {
    let app = app(1);

    let (status, _) = send(&app, Method::POST, "/quota/device-2/approve").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, Method::GET, "/quota/device-2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["day_count"], 0);

    let (status, _) = send(&app, Method::POST, "/quota/device-2/use").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, Method::GET, "/quota/device-2").await;
    assert_eq!(body["day_count"], 1);
    assert_eq!(body["remaining_day"], 0);
    assert_eq!(body["at_quota"], true);
}

#[tokio::test]
async fn test_use_without_approval_conflicts() {
    let app = app(5);

    let (status, body) = send(&app, Method::POST, "/quota/device-3/use").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_release_keeps_budget() {
    let app = app(1);

    send(&app, Method::POST, "/quota/device-4/approve").await;
    let (status, _) = send(&app, Method::POST, "/quota/device-4/release").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, Method::POST, "/quota/device-4/use").await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, Method::POST, "/quota/device-4/reserve").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_clear_resets_counters() {
    let app = app(1);

    send(&app, Method::POST, "/quota/device-5/reserve").await;
    let (status, _) = send(&app, Method::POST, "/quota/device-5/reserve").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, body) = send(&app, Method::DELETE, "/quota/device-5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity"], "device-5");

    let (status, _) = send(&app, Method::POST, "/quota/device-5/reserve").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_oversized_entity_is_rejected() {
    let app = app(1);
    let uri = format!("/quota/{}/reserve", "x".repeat(300));

    let (status, _) = send(&app, Method::POST, &uri).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = app(1);

    let (status, body) = send(&app, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rule_id"], "api-rule");
    assert_eq!(body["store"]["backend"], "memory");
}
