//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, header::AUTHORIZATION},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::auth::{CallerAuthenticator, VerifiedCaller};
use crate::identity::{AccessGrant, Handle, LifecycleManager, ReclaimTally, TokenBroker};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Gate for every `/api` route
    pub authenticator: Arc<CallerAuthenticator>,
    /// Identity lifecycle operations
    pub manager: Arc<LifecycleManager>,
    /// Access token minting
    pub broker: Arc<TokenBroker>,
    /// Inactivity window used by `/api/cleanup`
    pub reclaim_after: Duration,
    /// Maximum accepted request body size (bytes)
    pub max_body_size: usize,
}

/// Body of every operation that targets one identity.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HandleRequest {
    email: String,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let max_body_size = state.max_body_size;

    Router::new()
        .route("/status", get(status_handler))
        .route("/api/create", post(create_handler))
        .route("/api/delete", post(delete_handler))
        .route("/api/renew", post(renew_handler))
        .route("/api/token", post(token_handler))
        .route("/api/cleanup", post(cleanup_handler))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the gate on the request's `Authorization` header.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<VerifiedCaller> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    state.authenticator.authorize(header).await
}

/// Parse `{"email": "..."}` into a validated handle.
fn parse_handle(body: &[u8]) -> Result<Handle> {
    let request: HandleRequest = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("expected {{\"email\": string}}: {e}")))?;
    Handle::parse(&request.email)
}

/// GET /status: liveness probe, not gated
async fn status_handler() -> Json<Value> {
    Json(json!({}))
}

/// POST /api/create
async fn create_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let caller = authorize(&state, &headers).await?;
    let handle = state.manager.create().await?;
    info!(caller = %caller.principal, handle = %handle, "create");
    Ok(Json(json!({ "email": handle })))
}

/// POST /api/delete
async fn delete_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let caller = authorize(&state, &headers).await?;
    let handle = parse_handle(&body)?;
    state.manager.delete(&handle).await?;
    info!(caller = %caller.principal, handle = %handle, "delete");
    Ok(Json(json!({})))
}

/// POST /api/renew
async fn renew_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    authorize(&state, &headers).await?;
    let handle = parse_handle(&body)?;
    state.manager.renew(&handle).await?;
    Ok(Json(json!({})))
}

/// POST /api/token
async fn token_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AccessGrant>> {
    authorize(&state, &headers).await?;
    let handle = parse_handle(&body)?;
    let grant = state.broker.issue(&handle).await?;
    Ok(Json(grant))
}

/// POST /api/cleanup
async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ReclaimTally>> {
    let caller = authorize(&state, &headers).await?;
    let tally = state.manager.reclaim_expired(state.reclaim_after).await?;
    info!(
        caller = %caller.principal,
        succeeded = tally.succeeded,
        failed = tally.failed,
        "cleanup"
    );
    Ok(Json(tally))
}
