#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use file2ai::build_app_router;
use file2ai::config::AppConfig;
use file2ai::state::AppState;
use file2ai_core::contract::{Converter, MockRepoFetcher};
use file2ai_core::job::JobId;
use file2ai_core::registry::JobRegistry;
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Config pointing the results directory at `results`.
pub fn test_config(results: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.core.results_dir = results.to_path_buf();
    config.server.request_timeout_secs = 30;
    config
}

/// Full router with the built-in converter and the `git` CLI.
pub fn build_test_app(results: &Path) -> (Router, AppState) {
    let state = AppState::new(test_config(results));
    (build_app_router(state.clone()), state)
}

/// Full router with a scripted converter and a fetcher that must not be used.
pub fn build_test_app_with(results: &Path, converter: impl Converter + 'static) -> (Router, AppState) {
    let config = test_config(results);
    let mut fetcher = MockRepoFetcher::new();
    fetcher.expect_fetch().never();
    let registry = JobRegistry::new(config.core.clone(), Arc::new(converter), Arc::new(fetcher));
    let state = AppState::with_registry(config, registry);
    (build_app_router(state.clone()), state)
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

pub async fn delete(app: &Router, uri: &str) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

pub async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

pub const BOUNDARY: &str = "file2ai-test-boundary";

/// Builds a multipart body from `(field, Some(file_name), content)` parts.
pub fn multipart_body(parts: &[(&str, Option<&str>, &str)]) -> String {
    let mut body = String::new();
    for (field, file_name, content) in parts {
        body.push_str(&format!("--{BOUNDARY}\r\n"));
        match file_name {
            Some(file_name) => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )),
            None => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{field}\"\r\n\r\n"
            )),
        }
        body.push_str(content);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    body
}

pub async fn post_multipart(app: &Router, uri: &str, body: String) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap(),
    )
    .await
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Asserts a 202 and returns the job id from the body.
pub async fn accepted_job(response: Response<Body>) -> JobId {
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    json["job_id"].as_str().unwrap().parse().unwrap()
}
