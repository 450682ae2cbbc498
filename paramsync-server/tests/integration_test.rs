//! HTTP surface integration tests: exercise the assembled router with
//! `tower::ServiceExt::oneshot`, the same way the teacher crate's own
//! integration tests drive a server end to end without a real socket.

use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use jsonwebtoken::Algorithm;
use paramsync_server::auth::TokenVerifier;
use paramsync_server::hub::HubRegistry;
use paramsync_server::http::{build_router, AppState};
use paramsync_server::query::QuerySurface;
use paramsync_server::store::NullStore;
use serde_json::Value;
use tower::ServiceExt;

fn test_state() -> AppState {
    let store = Arc::new(NullStore);
    let hubs = Arc::new(HubRegistry::new(store.clone()));
    let query = Arc::new(QuerySurface::new(hubs.clone(), store));
    let verifier = Arc::new(TokenVerifier::new(
        "integration-test-secret",
        Algorithm::HS256,
        std::time::Duration::from_secs(3600),
    ));
    AppState {
        hubs,
        verifier,
        query,
        started_at: Instant::now(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok_with_no_active_sessions() {
    let router = build_router(test_state(), "http://localhost:3000");
    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn anonymous_login_issues_a_verifiable_token() {
    let router = build_router(test_state(), "http://localhost:3000");
    let response = router
        .oneshot(
            Request::post("/auth/anonymous")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"username": "Guest"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["username"], "Guest");
    assert_eq!(body["is_anonymous"], true);
    assert!(body["token"].as_str().unwrap().split('.').count() == 3);
}

#[tokio::test]
async fn creating_and_listing_sessions() {
    let router = build_router(test_state(), "http://localhost:3000");

    let create = router
        .clone()
        .oneshot(
            Request::post("/sessions")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::OK);
    let created = body_json(create).await;
    let session_id = created["session_id"].as_str().unwrap().to_string();
    assert_eq!(session_id.len(), 8);
    assert_eq!(created["join_url"], format!("/trilogic?session={session_id}"));

    // No one has connected yet, so it shouldn't show up as a live session.
    let list = router
        .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let sessions = body_json(list).await;
    assert!(sessions.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn missing_session_returns_not_found() {
    let router = build_router(test_state(), "http://localhost:3000");
    let response = router
        .oneshot(
            Request::get("/sessions/doesnotexist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn history_without_a_persistence_store_returns_service_unavailable() {
    // NullStore reports itself disabled, so every history route should
    // 503 rather than silently returning neutral results.
    let router = build_router(test_state(), "http://localhost:3000");
    let response = router
        .oneshot(
            Request::get("/history/some-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert!(body["detail"].is_string());
}
