//! Health check handler

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::server::AppState;

/// Health check with pool/session/connection gauges
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let pool = state.pool.stats().await;
    let sessions = state.registry.stats();

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sessions": sessions,
        "pool": pool,
        "connections": state.hub.connection_count(),
        "rate_limited_clients": state.limiter.client_count(),
    }))
}
