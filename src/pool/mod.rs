//! Bounded resource pool with session affinity
//!
//! Pools expensive acquire-to-use resources (outbound HTTP clients bound to
//! a sticky upstream identity, or render-capable handles behind the same
//! factory seam). A session that already owns a resource always gets it
//! back; otherwise a free resource is assigned, a new one is created while
//! capacity remains, and exhausted pools make callers wait on a bounded
//! poll loop instead of blocking forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{GatehouseError, Result};

/// Idle cleanup never shrinks the pool below this many resources
const MIN_RETAINED: usize = 2;

/// Device-class profile a pooled resource was created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceClass {
    #[default]
    Desktop,
    Mobile,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Desktop => "desktop",
            ResourceClass::Mobile => "mobile",
        }
    }
}

/// Creates, resets, and tears down pooled handles
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Create a new handle for a session (expensive)
    async fn create(&self, session_id: &str, class: ResourceClass) -> Result<Self::Handle>;

    /// Point an existing handle at a new owning session. Called under the
    /// pool lock when a free resource is assigned, so a handle never
    /// carries the previous owner's upstream identity.
    async fn bind(&self, handle: &Self::Handle, session_id: &str) {
        let _ = (handle, session_id);
    }

    /// Clear transient per-use state before the handle goes back to the
    /// free list (e.g. navigate a render handle to a blank page)
    async fn reset(&self, handle: &Self::Handle);

    /// Best-effort teardown of a reclaimed handle
    async fn destroy(&self, handle: &Self::Handle);
}

/// A single pooled resource
struct PooledResource<H> {
    handle: Arc<H>,
    class: ResourceClass,
    session_id: Option<String>,
    busy: bool,
    last_used: Instant,
}

struct PoolInner<H> {
    resources: HashMap<Uuid, PooledResource<H>>,
    /// session id -> resource id, populated only while the session owns one
    session_map: HashMap<String, Uuid>,
}

/// Pool statistics for health reporting
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub busy: usize,
    pub max_size: usize,
}

/// Bounded pool of factory-created resources with session affinity
pub struct ResourcePool<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    // One critical section guards both the free/busy transitions and the
    // size check-and-create sequence, so two concurrent acquires cannot
    // both decide to create when only one slot remains.
    inner: Mutex<PoolInner<F::Handle>>,
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            inner: Mutex::new(PoolInner {
                resources: HashMap::new(),
                session_map: HashMap::new(),
            }),
        }
    }

    /// Acquire a resource for a session, waiting up to the configured
    /// acquire timeout when the pool is exhausted
    #[instrument(skip(self), fields(class = class.as_str()))]
    pub async fn acquire(&self, session_id: &str, class: ResourceClass) -> Result<Arc<F::Handle>> {
        let deadline = Instant::now() + Duration::from_secs(self.config.acquire_timeout);

        loop {
            {
                let mut inner = self.inner.lock().await;

                // Affinity: the owning session gets its resource back,
                // regardless of the requested class.
                if let Some(&resource_id) = inner.session_map.get(session_id) {
                    if let Some(resource) = inner.resources.get_mut(&resource_id) {
                        resource.last_used = Instant::now();
                        return Ok(resource.handle.clone());
                    }
                    // Stale mapping left behind by a reclaimed resource.
                    inner.session_map.remove(session_id);
                }

                // Assign a free resource of the requested class.
                let free_id = inner
                    .resources
                    .iter()
                    .find(|(_, r)| !r.busy && r.class == class)
                    .map(|(&id, _)| id);
                if let Some(resource_id) = free_id {
                    let resource = inner.resources.get_mut(&resource_id).unwrap();
                    resource.busy = true;
                    resource.session_id = Some(session_id.to_string());
                    resource.last_used = Instant::now();
                    let handle = resource.handle.clone();
                    inner
                        .session_map
                        .insert(session_id.to_string(), resource_id);
                    self.factory.bind(&handle, session_id).await;
                    debug!("Assigned free resource {} to session {}", resource_id, session_id);
                    return Ok(handle);
                }

                // Create a new resource while capacity remains. A failed
                // create does not grow the pool; the caller falls through
                // to the wait branch below.
                if inner.resources.len() < self.config.max_size {
                    match self.factory.create(session_id, class).await {
                        Ok(handle) => {
                            let resource_id = Uuid::new_v4();
                            let handle = Arc::new(handle);
                            inner.resources.insert(
                                resource_id,
                                PooledResource {
                                    handle: handle.clone(),
                                    class,
                                    session_id: Some(session_id.to_string()),
                                    busy: true,
                                    last_used: Instant::now(),
                                },
                            );
                            inner
                                .session_map
                                .insert(session_id.to_string(), resource_id);
                            debug!(
                                "Created resource {} for session {} (pool size {})",
                                resource_id,
                                session_id,
                                inner.resources.len()
                            );
                            return Ok(handle);
                        }
                        Err(e) => {
                            warn!("Resource creation failed for session {}: {}", session_id, e);
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    "Session {} timed out waiting for a pooled resource",
                    session_id
                );
                return Err(GatehouseError::ResourceExhausted);
            }

            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    /// Release the resource owned by a session back to the free list
    pub async fn release(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;

        let Some(resource_id) = inner.session_map.remove(session_id) else {
            return;
        };

        let Some(handle) = inner.resources.get(&resource_id).map(|r| r.handle.clone()) else {
            return;
        };

        // Reset before the resource becomes visible as free; the lock is
        // held so no other acquire can grab a half-reset handle.
        self.factory.reset(&handle).await;

        if let Some(resource) = inner.resources.get_mut(&resource_id) {
            resource.busy = false;
            resource.session_id = None;
            resource.last_used = Instant::now();
            debug!("Released resource {} from session {}", resource_id, session_id);
        }
    }

    /// Destroy free resources idle past the threshold, retaining a floor
    /// so the next request avoids cold-start cost. Returns the number
    /// reclaimed.
    pub async fn cleanup_idle(&self) -> usize {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout);
        let mut inner = self.inner.lock().await;

        let mut victims: Vec<Uuid> = inner
            .resources
            .iter()
            .filter(|(_, r)| !r.busy && r.last_used.elapsed() > idle_timeout)
            .map(|(&id, _)| id)
            .collect();

        // Keep at least MIN_RETAINED resources in the pool.
        let removable = inner.resources.len().saturating_sub(MIN_RETAINED);
        victims.truncate(removable);

        for resource_id in &victims {
            if let Some(resource) = inner.resources.remove(resource_id) {
                self.factory.destroy(&resource.handle).await;
                debug!("Reclaimed idle resource {}", resource_id);
            }
        }

        if !victims.is_empty() {
            info!("Reclaimed {} idle pooled resources", victims.len());
        }

        victims.len()
    }

    /// Current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            total: inner.resources.len(),
            busy: inner.resources.values().filter(|r| r.busy).count(),
            max_size: self.config.max_size,
        }
    }

    /// Run the periodic idle reaper until shutdown is signalled
    #[instrument(skip(self, shutdown))]
    pub async fn run_reaper(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting pool reaper (idle timeout: {}s, interval: {}s)",
            self.config.idle_timeout, self.config.reap_interval
        );

        let mut tick = interval(Duration::from_secs(self.config.reap_interval.max(1)));
        tick.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.cleanup_idle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    async fn snapshot(&self) -> Vec<(bool, Option<String>)> {
        let inner = self.inner.lock().await;
        inner
            .resources
            .values()
            .map(|r| (r.busy, r.session_id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockFactory {
        created: AtomicUsize,
        binds: AtomicUsize,
        resets: AtomicUsize,
        destroyed: AtomicUsize,
        fail_creates: AtomicBool,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                binds: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                fail_creates: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ResourceFactory for MockFactory {
        type Handle = usize;

        async fn create(&self, _session_id: &str, _class: ResourceClass) -> Result<usize> {
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(GatehouseError::Internal("create failed".into()));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn bind(&self, _handle: &usize, _session_id: &str) {
            self.binds.fetch_add(1, Ordering::SeqCst);
        }

        async fn reset(&self, _handle: &usize) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        async fn destroy(&self, _handle: &usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_pool_config(max_size: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            idle_timeout: 300,
            acquire_timeout: 2,
            poll_interval_ms: 50,
            reap_interval: 60,
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_and_reuses_by_affinity() {
        let pool = ResourcePool::new(MockFactory::new(), test_pool_config(4));

        let first = pool.acquire("s1", ResourceClass::Desktop).await.unwrap();
        let again = pool.acquire("s1", ResourceClass::Desktop).await.unwrap();

        assert_eq!(*first, *again);
        assert_eq!(pool.factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_affinity_outranks_requested_class() {
        let pool = ResourcePool::new(MockFactory::new(), test_pool_config(4));

        let desktop = pool.acquire("s1", ResourceClass::Desktop).await.unwrap();
        let same = pool.acquire("s1", ResourceClass::Mobile).await.unwrap();
        assert_eq!(*desktop, *same);
    }

    #[tokio::test]
    async fn test_distinct_sessions_get_distinct_resources() {
        let pool = ResourcePool::new(MockFactory::new(), test_pool_config(4));

        let a = pool.acquire("s1", ResourceClass::Desktop).await.unwrap();
        let b = pool.acquire("s2", ResourceClass::Desktop).await.unwrap();
        assert_ne!(*a, *b);

        // Busy implies exactly one owner; free implies no owner.
        for (busy, owner) in pool.snapshot().await {
            assert!(busy);
            assert!(owner.is_some());
        }
    }

    #[tokio::test]
    async fn test_release_clears_owner_and_resets() {
        let pool = ResourcePool::new(MockFactory::new(), test_pool_config(4));

        pool.acquire("s1", ResourceClass::Desktop).await.unwrap();
        pool.release("s1").await;

        assert_eq!(pool.factory.resets.load(Ordering::SeqCst), 1);
        for (busy, owner) in pool.snapshot().await {
            assert!(!busy);
            assert!(owner.is_none());
        }

        // A released resource is reassigned instead of creating a new one,
        // and rebound to the new owner.
        pool.acquire("s2", ResourceClass::Desktop).await.unwrap();
        assert_eq!(pool.factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.factory.binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_without_ownership_is_a_noop() {
        let pool = ResourcePool::new(MockFactory::new(), test_pool_config(4));
        pool.release("ghost").await;
        assert_eq!(pool.factory.resets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_times_out() {
        let pool = ResourcePool::new(MockFactory::new(), test_pool_config(1));

        pool.acquire("s1", ResourceClass::Desktop).await.unwrap();
        let result = pool.acquire("s2", ResourceClass::Desktop).await;

        assert!(matches!(result, Err(GatehouseError::ResourceExhausted)));
        assert_eq!(pool.stats().await.total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_resource_freed_by_release() {
        let pool = Arc::new(ResourcePool::new(MockFactory::new(), test_pool_config(1)));

        let held = pool.acquire("s1", ResourceClass::Desktop).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("s2", ResourceClass::Desktop).await })
        };

        // Let the waiter enter its poll loop, then free the resource.
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.release("s1").await;

        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(*acquired, *held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_does_not_grow_pool() {
        let factory = MockFactory::new();
        factory.fail_creates.store(true, Ordering::SeqCst);
        let pool = ResourcePool::new(factory, test_pool_config(4));

        let result = pool.acquire("s1", ResourceClass::Desktop).await;
        assert!(matches!(result, Err(GatehouseError::ResourceExhausted)));
        assert_eq!(pool.stats().await.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_idle_respects_floor() {
        let mut config = test_pool_config(8);
        config.idle_timeout = 10;
        let pool = ResourcePool::new(MockFactory::new(), config);

        for i in 0..4 {
            pool.acquire(&format!("s{}", i), ResourceClass::Desktop)
                .await
                .unwrap();
        }
        for i in 0..4 {
            pool.release(&format!("s{}", i)).await;
        }

        tokio::time::sleep(Duration::from_secs(30)).await;

        let reclaimed = pool.cleanup_idle().await;
        assert_eq!(reclaimed, 2);
        assert_eq!(pool.stats().await.total, MIN_RETAINED);
        assert_eq!(pool.factory.destroyed.load(Ordering::SeqCst), 2);

        // A second pass never drops below the floor.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pool.cleanup_idle().await, 0);
        assert_eq!(pool.stats().await.total, MIN_RETAINED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_skips_busy_resources() {
        let mut config = test_pool_config(8);
        config.idle_timeout = 10;
        let pool = ResourcePool::new(MockFactory::new(), config);

        for i in 0..4 {
            pool.acquire(&format!("s{}", i), ResourceClass::Desktop)
                .await
                .unwrap();
        }
        // Only two of four go idle.
        pool.release("s0").await;
        pool.release("s1").await;

        tokio::time::sleep(Duration::from_secs(30)).await;

        pool.cleanup_idle().await;
        let stats = pool.stats().await;
        assert_eq!(stats.busy, 2);
        assert!(stats.total >= 2);
    }

    #[tokio::test]
    async fn test_class_mismatch_creates_separate_resource() {
        let pool = ResourcePool::new(MockFactory::new(), test_pool_config(4));

        pool.acquire("s1", ResourceClass::Desktop).await.unwrap();
        pool.release("s1").await;

        // The free desktop resource does not satisfy a mobile request.
        pool.acquire("s2", ResourceClass::Mobile).await.unwrap();
        assert_eq!(pool.factory.created.load(Ordering::SeqCst), 2);
    }
}
