//! Gatehouse Proxy Gateway - Entry Point
//!
//! Starts the gateway server and background services with graceful
//! shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod fetch;
mod models;
mod pool;
mod rewrite;
mod session;
mod upstream;

use api::middleware::RateLimiter;
use api::websocket::ConnectionHub;
use api::GatewayServer;
use config::Config;
use fetch::{ClientFactory, Fetcher};
use pool::ResourcePool;
use rewrite::ContentRewriter;
use session::{SessionRegistry, SessionSweeper, SessionSweeperHandle};
use upstream::StickySessionBinder;

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatehouse=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gatehouse Proxy Gateway");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");

    // Sticky upstream binding
    let binder = Arc::new(StickySessionBinder::new(config.upstream.clone()));
    if config.upstream.server.is_empty() {
        info!("No upstream proxy configured, fetching directly");
    } else {
        info!(
            "Upstream egress: {} ({} sticky tokens)",
            config.upstream.server,
            config.upstream.sticky_tokens.len()
        );
    }

    // Outbound client pool
    let factory = ClientFactory::new(
        binder.clone(),
        config.spoof.clone(),
        config.gateway.request_timeout,
    );
    let pool = Arc::new(ResourcePool::new(factory, config.pool.clone()));
    let fetcher = Arc::new(Fetcher::new(pool.clone()));

    // Content rewriting
    let rewriter = Arc::new(ContentRewriter::new(
        config.gateway.public_base.clone(),
        &config.spoof,
    ));

    // Sessions and admission control
    let registry = Arc::new(SessionRegistry::new(config.session.clone()));
    let limiter = RateLimiter::new(
        config.rate_limit.enabled,
        config.rate_limit.requests_per_minute,
        config.rate_limit.burst_size,
    );
    let hub = Arc::new(ConnectionHub::new(
        config.gateway.heartbeat_interval,
        config.gateway.heartbeat_timeout,
    ));

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    // Start the session sweeper
    let (sweeper_handle, sweeper_shutdown) = SessionSweeperHandle::new();
    let sweeper = SessionSweeper::new(
        registry.clone(),
        limiter.clone(),
        config.session.sweep_interval,
    );
    let sweeper_task = tokio::spawn(async move {
        sweeper.run(sweeper_shutdown).await;
    });

    // Start the pool reaper
    let reaper_pool = pool.clone();
    let reaper_shutdown = shutdown_tx.subscribe();
    let reaper_task = tokio::spawn(async move {
        reaper_pool.run_reaper(reaper_shutdown).await;
    });

    // Start the heartbeat service
    let heartbeat_hub = hub.clone();
    let heartbeat_registry = registry.clone();
    let heartbeat_pool = pool.clone();
    let heartbeat_shutdown = shutdown_tx.subscribe();
    let heartbeat_task = tokio::spawn(async move {
        heartbeat_hub
            .run_heartbeat(heartbeat_registry, heartbeat_pool, heartbeat_shutdown)
            .await;
    });

    // Create and start the gateway server
    let server = GatewayServer::new(
        config.clone(),
        registry,
        binder,
        pool,
        fetcher,
        rewriter,
        limiter,
        hub,
    );

    let server_shutdown = shutdown_tx.subscribe();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown).await {
            error!("Gateway server error: {}", e);
        }
    });

    info!(
        "Gateway started on {}:{}",
        config.gateway.host, config.gateway.port
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    // Send shutdown signal to all services
    let _ = shutdown_tx.send(true);
    sweeper_handle.shutdown();

    // Wait for all tasks to complete
    let _ = tokio::join!(server_task, sweeper_task, reaper_task, heartbeat_task);

    info!("Gatehouse Proxy Gateway stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
