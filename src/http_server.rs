//! HTTP server implementation using Axum.

use crate::auth::{self, AuthUser};
use crate::config::AppSpec;
use crate::error::{Error, Result};
use crate::manager::SessionView;
use crate::relay::ws::ws_handler;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path as FsPath;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

// Request/Response types
#[derive(Deserialize)]
struct LoginQuery {
    at: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    access_token: Option<String>,
}

#[derive(Serialize)]
struct LoginResponse {
    jwt: String,
    ok: bool,
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    app: String,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    sid: String,
}

#[derive(Deserialize)]
struct SecretCheckRequest {
    sid: String,
    secret: String,
}

pub fn router(state: AppState, public_dir: &FsPath) -> Router {
    Router::new()
        .route("/api/v1/try_login", get(try_login).post(try_login))
        .route("/api/v1/apps", get(list_apps))
        .route("/api/v1/session", post(create_session).delete(stop_session))
        .route("/api/v1/session/:id", get(get_session))
        .route("/api/v1/session/secret/check", post(check_secret))
        .route("/api/v1/ws", get(ws_handler))
        // Health check
        .route("/health", get(health))
        .fallback_service(ServeDir::new(public_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, public_dir: &FsPath, state: AppState) -> std::io::Result<()> {
    let app = router(state, public_dir);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> &'static str {
    "OK"
}

async fn try_login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    body: Option<Json<LoginRequest>>,
) -> Result<Json<LoginResponse>> {
    let credential = body
        .and_then(|Json(req)| req.access_token)
        .or(query.at)
        .filter(|c| !c.is_empty())
        .ok_or(Error::BadRequest("accessToken is required"))?;

    let user = auth::find_by_credential(&state.config.users, &credential)
        .ok_or_else(|| Error::Unauthorized("invalid access token".into()))?;
    let jwt = state.tokens.issue(user)?;
    info!(user = %user.id, "User logged in");

    Ok(Json(LoginResponse { jwt, ok: true }))
}

async fn list_apps(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<AppSpec>>> {
    if !user.can_list_apps {
        return Err(Error::Forbidden("user may not list apps"));
    }
    Ok(Json(state.config.app_specs.clone()))
}

async fn create_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>> {
    if !user.can_start_session {
        return Err(Error::Forbidden("user may not start sessions"));
    }
    let app_spec = state
        .config
        .find_app(&req.app)
        .ok_or_else(|| Error::NotFound(format!("app {}", req.app)))?;

    let sid = state.manager.launch_for_user(&user, app_spec).await?;
    info!(user = %user.id, app = %app_spec.id, sid = %sid, "Created session");

    Ok(Json(CreateSessionResponse { sid }))
}

async fn get_session(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SessionView>> {
    let entry = state
        .manager
        .get_session(&id)
        .await
        .ok_or_else(|| Error::NotFound("session".into()))?;
    Ok(Json(entry.view(&id)))
}

async fn stop_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Value>> {
    let not_found = || Error::NotFound("session".into());
    let sid = state
        .manager
        .session_for_user(&user.id)
        .await
        .ok_or_else(not_found)?;
    let instance = state.manager.get_instance(&sid).await.ok_or_else(not_found)?;

    info!(user = %user.id, sid = %sid, "Stop requested");
    instance.request_stop().await;

    Ok(Json(json!({ "ok": true, "sid": sid })))
}

async fn check_secret(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(req): Json<SecretCheckRequest>,
) -> Json<Value> {
    let ok = match state.manager.get_instance(&req.sid).await {
        Some(instance) => instance.secret_matches(&req.secret),
        None => false,
    };
    Json(json!({ "ok": ok }))
}
