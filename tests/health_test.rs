mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, TestApp};
use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, ResponseTemplate,
};

#[tokio::test]
async fn health_reports_provider_balance() {
    let app = TestApp::new().await;
    Mock::given(method("POST"))
        .and(path("/cek-saldo"))
        .and(body_partial_json(json!({ "cmd": "deposit", "username": "shop" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "deposit": 1_250_000 } })),
        )
        .mount(&app.provider)
        .await;

    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"]["status"], "up");
    assert_eq!(body["provider_balance"], 1_250_000);
}

#[tokio::test]
async fn unreachable_provider_degrades_health() {
    let app = TestApp::new().await;
    Mock::given(method("POST"))
        .and(path("/cek-saldo"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&app.provider)
        .await;

    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert!(body["provider_balance"].is_null());
}

#[tokio::test]
async fn status_and_openapi_are_served() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/api/v1/status", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["service"], "topup-api");
    assert_eq!(body["data"]["environment"], "test");

    let response = app
        .request(Method::GET, "/api-docs/openapi.json", None, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let doc = response_json(response).await;
    assert!(doc["paths"]["/api/v1/checkout"].is_object());
}

#[tokio::test]
async fn balance_requires_signed_in_user() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/api/v1/balance", None, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(Method::GET, "/api/v1/balance", None, Some("ghost"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
