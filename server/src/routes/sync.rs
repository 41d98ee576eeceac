//! Sync endpoint routes.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use shelf_engine::DomainEvent;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{
    handle_latest, handle_pull, handle_push, handle_resolve, LatestResponse, PullQuery,
    PullResponse, PushRequest, PushResponse, ResolveRequest, ResolveResponse,
};
use crate::websocket::ServerMessage;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/push", post(push_handler))
        .route("/sync/pull", get(pull_handler))
        .route("/sync/latest", get(latest_handler))
        .route("/sync/resolve", post(resolve_handler))
}

/// Tell the identity's WebSocket clients about newly recorded events.
fn notify(state: &AppState, identity: &str, events: Vec<DomainEvent>, server_timestamp: u64) {
    if events.is_empty() {
        return;
    }
    let notice = ServerMessage::events_available(events, server_timestamp);
    state.connections.broadcast(identity, None, &notice);
}

/// POST /sync/push
async fn push_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let outcome = handle_push(&state.pool, &auth.identity, state.config.max_push_batch, request).await?;
    notify(
        &state,
        &auth.identity,
        outcome.recorded,
        outcome.response.server_timestamp,
    );
    Ok(Json(outcome.response))
}

/// GET /sync/pull?since&limit
async fn pull_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>> {
    let response = handle_pull(&state.pool, &auth.identity, query).await?;
    Ok(Json(response))
}

/// GET /sync/latest
async fn latest_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<LatestResponse>> {
    let response = handle_latest(&state.pool, &auth.identity).await?;
    Ok(Json(response))
}

/// POST /sync/resolve
async fn resolve_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>> {
    let outcome = handle_resolve(&state.pool, &auth.identity, request).await?;
    if !outcome.replaced.is_empty() {
        let latest = handle_latest(&state.pool, &auth.identity).await?;
        notify(&state, &auth.identity, outcome.replaced, latest.server_timestamp);
    }
    Ok(Json(outcome.response))
}
