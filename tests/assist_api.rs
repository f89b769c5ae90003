use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use maintainer_assist_gateway::{
    backend::mock::MockBackend, build_app, models::BackendDescriptor,
    orchestrator::RegisteredBackend, state::AppState,
};
use serde_json::Value;
use tower::util::ServiceExt;

fn app_with(backend: &MockBackend) -> Router {
    let registered = RegisteredBackend::new(
        BackendDescriptor::new("mock-a", ["troubleshooting"], 1.0, true),
        Arc::new(backend.clone()),
    );
    build_app(AppState::new_for_tests(vec![registered]).expect("test state"))
}

fn assist_request(body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/assist")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("request build")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn returns_cache_hit_on_repeated_identical_request() {
    let backend = MockBackend::named("mock-a");
    let app = app_with(&backend);
    let body = r#"{"query":"Compressor keeps tripping on overload","context_tags":["troubleshooting"]}"#;

    let first = app
        .clone()
        .oneshot(assist_request(body))
        .await
        .expect("first request execution");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        first
            .headers()
            .get("x-cache")
            .and_then(|value| value.to_str().ok()),
        Some("miss")
    );
    let first_json = json_body(first).await;
    assert_eq!(first_json["backend_id"], "mock-a");
    assert_eq!(first_json["degraded"], false);
    assert_eq!(first_json["attempts"].as_array().map(Vec::len), Some(1));

    let second = app
        .oneshot(assist_request(body))
        .await
        .expect("second request execution");
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(
        second
            .headers()
            .get("x-cache")
            .and_then(|value| value.to_str().ok()),
        Some("hit")
    );
    let second_json = json_body(second).await;
    assert_eq!(second_json["cached"], true);
    assert_eq!(second_json["attempts"].as_array().map(Vec::len), Some(0));
    assert_eq!(second_json["text"], first_json["text"]);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn rejects_empty_query() {
    let app = app_with(&MockBackend::named("mock-a"));

    let response = app
        .oneshot(assist_request(r#"{"query":"   "}"#))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn rejects_malformed_json() {
    let app = app_with(&MockBackend::named("mock-a"));

    let response = app
        .oneshot(assist_request(r#"{"query": 42"#))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn lists_backend_status() {
    let app = app_with(&MockBackend::named("mock-a"));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/backends")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json[0]["id"], "mock-a");
    assert_eq!(json[0]["breaker"], "closed");
    assert_eq!(json[0]["is_local"], true);
}

#[tokio::test]
async fn metrics_expose_orchestration_results() {
    let app = app_with(&MockBackend::named("mock-a"));
    app.clone()
        .oneshot(assist_request(r#"{"query":"belt tracking drifts left"}"#))
        .await
        .expect("assist request");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("metrics request");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let text = String::from_utf8(bytes.to_vec()).expect("utf8 metrics");
    assert!(text.contains("assist_requests_total{result=\"answered\"} 1"));
    assert!(text.contains("assist_attempts_total{backend=\"mock-a\",outcome=\"success\"} 1"));
}

#[tokio::test]
async fn healthz_is_ok() {
    let app = app_with(&MockBackend::named("mock-a"));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
}
