//! Idle-session sweep service
//!
//! Periodically evicts sessions inactive past the configured timeout and
//! prunes stale rate-limiter state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, instrument};

use super::SessionRegistry;
use crate::api::middleware::RateLimiter;

/// Periodic sweep over sessions and rate-limiter records
pub struct SessionSweeper {
    registry: Arc<SessionRegistry>,
    limiter: RateLimiter,
    interval_secs: u64,
}

impl SessionSweeper {
    pub fn new(registry: Arc<SessionRegistry>, limiter: RateLimiter, interval_secs: u64) -> Self {
        Self {
            registry,
            limiter,
            interval_secs,
        }
    }

    /// Run the sweep loop until shutdown is signalled
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting session sweeper (interval: {}s)",
            self.interval_secs
        );

        let mut tick = interval(Duration::from_secs(self.interval_secs.max(1)));
        tick.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let evicted = self.registry.sweep_idle();
                    let pruned = self.limiter.sweep();
                    if evicted == 0 && pruned == 0 {
                        debug!("Sweep pass found nothing to evict");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Session sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle for stopping the sweeper
pub struct SessionSweeperHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl SessionSweeperHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_and_stops_on_shutdown() {
        let registry = Arc::new(SessionRegistry::new(SessionConfig {
            idle_timeout: 1,
            sweep_interval: 5,
            max_sessions: 100,
            history_limit: 10,
        }));
        registry.create(Some("s1".to_string()), None);
        registry.backdate("s1", 10);

        let limiter = RateLimiter::new(true, 100, 20);
        let sweeper = SessionSweeper::new(registry.clone(), limiter, 5);
        let (handle, shutdown_rx) = SessionSweeperHandle::new();

        let task = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

        // Advance past the first sweep tick.
        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        handle.shutdown();
        task.await.unwrap();

        assert_eq!(registry.count(), 0);
    }
}
