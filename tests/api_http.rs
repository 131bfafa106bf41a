// tests/api_http.rs
//
// Router-level tests without opening sockets, via tower::ServiceExt::oneshot.

use std::sync::{Arc, RwLock};

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use tower::ServiceExt as _;

use collectible_notifier::api::{self, AppState};
use collectible_notifier::pipeline::TickReport;
use collectible_notifier::scheduler::LastTick;

const BODY_LIMIT: usize = 1024 * 1024;

fn router(last_tick: LastTick) -> Router {
    api::create_router(AppState { last_tick })
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

#[tokio::test]
async fn health_returns_ok() {
    let (status, body) = get(router(Arc::new(RwLock::new(None))), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "ok");
}

#[tokio::test]
async fn status_before_first_tick() {
    let (status, body) = get(router(Arc::new(RwLock::new(None))), "/status").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["running"], false);
    assert!(v["last_tick"].is_null());
}

#[tokio::test]
async fn status_reports_last_tick() {
    let report = TickReport {
        fetched_a: 4,
        processed: 2,
        deliveries_ok: 3,
        ..Default::default()
    };
    let (_, body) = get(router(Arc::new(RwLock::new(Some(report)))), "/status").await;
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["running"], true);
    assert_eq!(v["last_tick"]["fetched_a"], 4);
    assert_eq!(v["last_tick"]["processed"], 2);
    assert_eq!(v["last_tick"]["deliveries_ok"], 3);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (status, _) = get(router(Arc::new(RwLock::new(None))), "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
