//! Session lifecycle handlers

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::api::server::AppState;
use crate::error::{GatehouseError, Result};

/// POST /api/sessions
pub async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Json<Value> {
    let session = state.registry.create(None, Some(addr.ip().to_string()));

    // Bind the egress identity immediately so the region is known.
    let token = state.binder.resolve(&session.id);
    state.registry.set_upstream_token(&session.id, token);

    Json(json!({
        "sessionId": session.id,
        "createdAt": session.created_at.to_rfc3339(),
        "boundRegion": state.binder.bound_region(),
    }))
}

/// GET /api/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let session = state
        .registry
        .get(&id)
        .ok_or(GatehouseError::SessionNotFound(id))?;

    Ok(Json(serde_json::to_value(&session).map_err(|e| {
        GatehouseError::Internal(format!("session serialization failed: {}", e))
    })?))
}

/// DELETE /api/sessions/:id — idempotent
pub async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    state.fetcher.release(&id).await;
    state.binder.reset(&id);
    let existed = state.registry.end(&id);

    Json(json!({
        "status": "ended",
        "existed": existed,
    }))
}

/// GET /api/sessions/:id/history
pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let session = state
        .registry
        .get(&id)
        .ok_or(GatehouseError::SessionNotFound(id))?;

    Ok(Json(json!({ "history": session.history })))
}
