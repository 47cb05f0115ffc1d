//! API route definitions

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::middleware::{cors_layer, rate_limit_middleware};
use super::server::AppState;
use super::websocket;

/// Create the gateway router with all routes
pub fn create_router(state: AppState) -> Router {
    let public_base = state.config.gateway.public_base.clone();
    let cors = cors_layer(&state.config.gateway.cors_origins);

    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))
        // Proxied content
        .route(
            &public_base,
            get(handlers::proxy::proxy_get).post(handlers::proxy::proxy_post),
        )
        // Session lifecycle
        .route("/api/sessions", post(handlers::session::create_session))
        .route(
            "/api/sessions/:id",
            get(handlers::session::get_session).delete(handlers::session::end_session),
        )
        .route(
            "/api/sessions/:id/history",
            get(handlers::session::get_history),
        )
        // Duplex channel
        .route("/ws", get(websocket::session_ws))
        // Every inbound operation passes the admission gate
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
