//! HTTP router assembly and the administrative surface: auth lifecycle,
//! live-session CRUD, and persisted-history access. Follows the same
//! `Router::new().route(...).layer(CorsLayer).with_state(state)` shape
//! the teacher's `build_router_internal` uses.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use paramsync_core::SessionState;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::connection;
use crate::hub::HubRegistry;
use crate::query::QuerySurface;

#[derive(Clone)]
pub struct AppState {
    pub hubs: Arc<HubRegistry>,
    pub verifier: Arc<TokenVerifier>,
    pub query: Arc<QuerySurface>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState, frontend_url: &str) -> Router {
    let cors = cors_layer(frontend_url);

    info!("building router with endpoints:");
    info!("  - GET  /health");
    info!("  - GET  /");
    info!("  - POST /auth/anonymous, /auth/login, /auth/refresh, /auth/verify");
    info!("  - GET  /auth/me");
    info!("  - POST /sessions, GET /sessions, GET /sessions/{{id}}, DELETE /sessions/{{id}}");
    info!("  - GET  /history/{{id}}, /full, /metadata, GET /history/active, DELETE /history/{{id}}");
    info!("  - GET  /api/v1/session/connect/{{session_id}} (websocket)");

    Router::new()
        .route("/health", get(health))
        .route("/", get(root))
        .route("/auth/anonymous", post(auth_anonymous))
        .route("/auth/login", post(auth_login))
        .route("/auth/refresh", post(auth_refresh))
        .route("/auth/verify", post(auth_verify))
        .route("/auth/me", get(auth_me))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{session_id}", get(get_session).delete(delete_session))
        .route("/history/{session_id}", get(get_history).delete(delete_history))
        .route("/history/{session_id}/full", get(get_full_history))
        .route("/history/{session_id}/metadata", get(get_metadata))
        .route("/history/active", get(get_active_sessions))
        .route("/api/v1/session/connect/{session_id}", get(connection::upgrade))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let mut layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any);

    let mut origins = vec!["http://localhost:3000".to_string()];
    if frontend_url != origins[0] {
        origins.push(frontend_url.to_string());
    }
    let parsed: Vec<HeaderValue> = origins
        .into_iter()
        .filter_map(|o| HeaderValue::from_str(&o).ok())
        .collect();
    layer = layer.allow_origin(parsed);
    layer
}

/// Uniform JSON error body, matching the `{"detail": "..."}` shape the
/// original FastAPI app returns.
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        ApiError {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "detail": self.detail }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
    uptime_seconds: u64,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.hubs.session_ids().len(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Serialize)]
struct RootResponse {
    service: &'static str,
    version: &'static str,
    active_sessions: usize,
}

async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(RootResponse {
        service: "paramsync-server",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.hubs.session_ids().len(),
    })
}

#[derive(Deserialize)]
struct AnonymousLoginRequest {
    username: Option<String>,
    #[allow(dead_code)]
    color: Option<String>,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: Option<String>,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    user_id: String,
    username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    is_anonymous: bool,
    expires_at: String,
}

#[derive(Deserialize)]
struct RefreshRequest {
    token: String,
}

#[derive(Serialize)]
struct RefreshResponse {
    token: String,
}

async fn auth_anonymous(
    State(state): State<AppState>,
    Json(req): Json<AnonymousLoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user_id = format!("anon_{}", Uuid::new_v4().simple());
    let username = req
        .username
        .unwrap_or_else(|| format!("User {}", &user_id[user_id.len() - 6..]));

    let token = state
        .verifier
        .issue(&user_id, &username, None, true)
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to create token"))?;
    let principal = state
        .verifier
        .verify(&token)
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to create token"))?;

    info!(user_id = %user_id, "anonymous user created");

    Ok(Json(LoginResponse {
        token,
        user_id,
        username,
        email: None,
        is_anonymous: true,
        expires_at: principal.expires_at.to_rfc3339(),
    }))
}

async fn auth_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let email = req
        .email
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "email required"))?;
    let user_id = format!("user_{}", Uuid::new_v4().simple());
    let username = email.split('@').next().unwrap_or(&email).to_string();

    let token = state
        .verifier
        .issue(&user_id, &username, Some(&email), false)
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to create token"))?;
    let principal = state
        .verifier
        .verify(&token)
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to create token"))?;

    info!(user_id = %user_id, "user authenticated");

    Ok(Json(LoginResponse {
        token,
        user_id,
        username,
        email: Some(email),
        is_anonymous: false,
        expires_at: principal.expires_at.to_rfc3339(),
    }))
}

async fn auth_refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let token = state
        .verifier
        .refresh(&req.token)
        .map_err(|_| ApiError::new(StatusCode::UNAUTHORIZED, "invalid or expired token"))?;
    Ok(Json(RefreshResponse { token }))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

async fn auth_verify(State(state): State<AppState>, Query(q): Query<TokenQuery>) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state
        .verifier
        .verify(&q.token)
        .map_err(|_| ApiError::new(StatusCode::UNAUTHORIZED, "invalid or expired token"))?;
    Ok(Json(serde_json::json!({
        "valid": true,
        "user_id": principal.user_id,
        "username": principal.display_name,
        "email": principal.email,
        "is_anonymous": principal.anonymous,
        "expires_at": principal.expires_at.to_rfc3339(),
    })))
}

async fn auth_me(State(state): State<AppState>, Query(q): Query<TokenQuery>) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state
        .verifier
        .verify(&q.token)
        .map_err(|_| ApiError::new(StatusCode::UNAUTHORIZED, "invalid or expired token"))?;
    Ok(Json(serde_json::json!({
        "user_id": principal.user_id,
        "username": principal.display_name,
        "email": principal.email,
        "is_anonymous": principal.anonymous,
        "expires_at": principal.expires_at.to_rfc3339(),
    })))
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    #[allow(dead_code)]
    name: Option<String>,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    join_url: String,
    created_at: String,
}

async fn create_session(Json(_req): Json<CreateSessionRequest>) -> Json<CreateSessionResponse> {
    let session_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    info!(session_id = %session_id, "creating new session");
    Json(CreateSessionResponse {
        join_url: format!("/trilogic?session={session_id}"),
        session_id,
        created_at: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
struct SessionInfo {
    session_id: String,
    user_count: usize,
    current_seq: u64,
    state: SessionState,
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let infos = state
        .query
        .list_live_sessions()
        .await
        .into_iter()
        .map(|s| SessionInfo {
            session_id: s.session_id,
            user_count: s.user_count,
            current_seq: s.seq,
            state: s.state,
        })
        .collect();
    Json(infos)
}

async fn get_session(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<Json<SessionInfo>, ApiError> {
    let info = state
        .query
        .get_live_session(&session_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "session not found"))?;
    Ok(Json(SessionInfo {
        session_id: info.session_id,
        user_count: info.user_count,
        current_seq: info.seq,
        state: info.state,
    }))
}

async fn delete_session(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.query.delete_live_session(&session_id) {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "session not found"));
    }
    info!(session_id = %session_id, "deleted live session");
    Ok(Json(serde_json::json!({ "status": "deleted", "session_id": session_id })))
}

#[derive(Deserialize, Default)]
struct HistoryQuery {
    #[serde(default)]
    start_seq: Option<u64>,
    /// `-1` (the default) means "no upper bound", matching the original
    /// `end_seq: int = -1` query parameter.
    #[serde(default)]
    end_seq: Option<i64>,
}

impl HistoryQuery {
    fn bounds(&self) -> (u64, Option<u64>) {
        let start = self.start_seq.unwrap_or(0);
        let end = match self.end_seq {
            Some(v) if v >= 0 => Some(v as u64),
            _ => None,
        };
        (start, end)
    }
}

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    events: Vec<paramsync_core::HistoryEvent>,
    total_count: usize,
}

/// `503` for every history-facing route when the persistence store is
/// disabled, matching `if not redis_service.is_enabled(): raise
/// HTTPException(503)` guarding each route in the original.
fn require_store_enabled(state: &AppState) -> Result<(), ApiError> {
    if state.query.is_enabled() {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "History not available (persistence store not configured)",
        ))
    }
}

async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    require_store_enabled(&state)?;
    let (start_seq, end_seq) = q.bounds();
    let events = state
        .query
        .get_history(&session_id, start_seq, end_seq)
        .await
        .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "history not available"))?;
    Ok(Json(HistoryResponse {
        session_id,
        total_count: events.len(),
        events,
    }))
}

async fn get_full_history(state: State<AppState>, path: Path<String>) -> Result<Json<HistoryResponse>, ApiError> {
    get_history(state, path, Query(HistoryQuery::default())).await
}

#[derive(Serialize)]
struct MetadataResponse {
    session_id: String,
    state: SessionState,
    users: Vec<paramsync_core::User>,
    user_count: usize,
    history_count: usize,
    seq: u64,
}

async fn get_metadata(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<Json<MetadataResponse>, ApiError> {
    require_store_enabled(&state)?;
    let metadata = state
        .query
        .get_persisted_metadata(&session_id)
        .await
        .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "history not available"))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "session not found"))?;

    Ok(Json(MetadataResponse {
        session_id: metadata.session_id,
        state: metadata.state,
        user_count: metadata.users.len(),
        users: metadata.users,
        history_count: metadata.history_count,
        seq: metadata.seq,
    }))
}

async fn get_active_sessions(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    require_store_enabled(&state)?;
    let sessions = state
        .query
        .list_persisted_sessions()
        .await
        .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "history not available"))?;
    Ok(Json(sessions))
}

async fn delete_history(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    require_store_enabled(&state)?;
    state
        .query
        .delete_history(&session_id)
        .await
        .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "history not available"))?;
    info!(session_id = %session_id, "deleted session history");
    Ok(Json(serde_json::json!({ "status": "deleted", "session_id": session_id })))
}
