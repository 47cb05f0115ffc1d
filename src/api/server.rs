//! Gateway HTTP server using Axum
//!
//! Serves the proxied-content endpoint, the session lifecycle API, the
//! health check, and the duplex WebSocket channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{info, instrument};

use crate::config::Config;
use crate::error::Result;
use crate::fetch::{ClientFactory, Fetcher};
use crate::pool::ResourcePool;
use crate::rewrite::ContentRewriter;
use crate::session::SessionRegistry;
use crate::upstream::StickySessionBinder;

use super::middleware::RateLimiter;
use super::routes;
use super::websocket::ConnectionHub;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub binder: Arc<StickySessionBinder>,
    pub pool: Arc<ResourcePool<ClientFactory>>,
    pub fetcher: Arc<Fetcher>,
    pub rewriter: Arc<ContentRewriter>,
    pub limiter: RateLimiter,
    pub hub: Arc<ConnectionHub>,
    pub started_at: Instant,
}

/// Gateway server
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        registry: Arc<SessionRegistry>,
        binder: Arc<StickySessionBinder>,
        pool: Arc<ResourcePool<ClientFactory>>,
        fetcher: Arc<Fetcher>,
        rewriter: Arc<ContentRewriter>,
        limiter: RateLimiter,
        hub: Arc<ConnectionHub>,
    ) -> Self {
        let state = AppState {
            config,
            registry,
            binder,
            pool,
            fetcher,
            rewriter,
            limiter,
            hub,
            started_at: Instant::now(),
        };

        Self { state }
    }

    /// Run the gateway server with graceful shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self
            .state
            .config
            .gateway_addr()
            .parse()
            .map_err(|e| crate::error::GatehouseError::InvalidConfig(format!(
                "invalid gateway address: {}",
                e
            )))?;

        let router = routes::create_router(self.state.clone());

        info!("Gateway server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| crate::error::GatehouseError::Internal(e.to_string()))?;

        info!("Gateway server shut down");
        Ok(())
    }
}
