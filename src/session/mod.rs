//! Live session tracking
//!
//! In-memory registry of application sessions. Sessions are created on
//! first contact, touched on every routed operation, and removed on
//! explicit end, idle timeout, or capacity pressure.

mod sweep;

pub use sweep::{SessionSweeper, SessionSweeperHandle};

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{GatehouseError, Result};
use crate::models::{DeviceInfo, Session};

/// Registry statistics for health reporting
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
}

/// Tracks all live sessions, keyed by identifier
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Create a session, reusing an existing one when the caller supplies a
    /// known identifier. Under capacity pressure the oldest-inactive
    /// session is evicted first.
    pub fn create(&self, id: Option<String>, client_addr: Option<String>) -> Session {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(mut existing) = self.sessions.get_mut(&id) {
            existing.touch();
            return existing.clone();
        }

        if self.sessions.len() >= self.config.max_sessions {
            self.evict_oldest_inactive();
        }

        let session = Session::new(id.clone(), client_addr);
        // The entry lock makes this atomic against a concurrent create for
        // the same identifier; the earlier insert wins.
        let session = self
            .sessions
            .entry(id.clone())
            .or_insert(session)
            .clone();
        info!("Created session {}", id);
        session
    }

    /// Look up a session, refreshing its activity timestamp
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get_mut(id).map(|mut session| {
            session.touch();
            session.clone()
        })
    }

    /// Apply a mutation to a session, refreshing its activity timestamp
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Session),
    {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| GatehouseError::SessionNotFound(id.to_string()))?;
        mutate(&mut session);
        session.touch();
        Ok(())
    }

    /// Record a navigated URL in the session history
    pub fn push_history(&self, id: &str, url: String) -> Result<()> {
        let limit = self.config.history_limit;
        self.update(id, |session| session.push_history(url, limit))
    }

    /// Store device metadata reported by the client
    pub fn update_device(&self, id: &str, device: DeviceInfo) -> Result<()> {
        self.update(id, |session| {
            let mobile = device.is_mobile();
            session
                .metadata
                .insert("is_mobile".to_string(), mobile.to_string());
            session.device_info = Some(device);
        })
    }

    /// Record the sticky upstream token bound to a session
    pub fn set_upstream_token(&self, id: &str, token: Option<String>) {
        let _ = self.update(id, |session| session.upstream_token = token);
    }

    /// End a session. Idempotent: ending an unknown session is a no-op.
    pub fn end(&self, id: &str) -> bool {
        if self.sessions.remove(id).is_some() {
            info!("Ended session {}", id);
            true
        } else {
            false
        }
    }

    /// Evict sessions idle past the configured timeout. Returns the number
    /// evicted.
    pub fn sweep_idle(&self) -> usize {
        let timeout = self.config.idle_timeout as i64;
        let before = self.sessions.len();

        self.sessions
            .retain(|_, session| session.is_active && session.idle_seconds() <= timeout);

        let evicted = before - self.sessions.len();
        if evicted > 0 {
            info!("Evicted {} idle sessions", evicted);
        }
        evicted
    }

    /// Evict the session with the oldest last-activity timestamp
    fn evict_oldest_inactive(&self) {
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|entry| entry.last_activity)
            .map(|entry| entry.key().clone());

        if let Some(id) = oldest {
            debug!("Evicting session {} under capacity pressure", id);
            self.sessions.remove(&id);
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            total: self.sessions.len(),
            active: self
                .sessions
                .iter()
                .filter(|entry| entry.is_active)
                .count(),
        }
    }

    #[cfg(test)]
    fn backdate(&self, id: &str, seconds: i64) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.last_activity = session.last_activity - chrono::Duration::seconds(seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig {
            idle_timeout: 3600,
            sweep_interval: 300,
            max_sessions: 4,
            history_limit: 3,
        }
    }

    #[test]
    fn test_create_generates_id_and_get_finds_it() {
        let registry = SessionRegistry::new(test_config());
        let session = registry.create(None, Some("10.0.0.1".to_string()));

        assert!(!session.id.is_empty());
        assert!(registry.get(&session.id).is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_create_with_known_id_reuses_session() {
        let registry = SessionRegistry::new(test_config());
        let first = registry.create(Some("s1".to_string()), None);
        let second = registry.create(Some("s1".to_string()), None);

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_end_is_idempotent() {
        let registry = SessionRegistry::new(test_config());
        registry.create(Some("s1".to_string()), None);

        assert!(registry.end("s1"));
        assert!(!registry.end("s1"));
        assert!(registry.get("s1").is_none());
    }

    #[test]
    fn test_idle_sweep_evicts_expired_sessions() {
        let registry = SessionRegistry::new(test_config());
        registry.create(Some("fresh".to_string()), None);
        registry.create(Some("stale".to_string()), None);
        registry.backdate("stale", 7200);

        let evicted = registry.sweep_idle();

        assert_eq!(evicted, 1);
        assert!(registry.get("stale").is_none());
        assert!(registry.get("fresh").is_some());
    }

    #[test]
    fn test_capacity_pressure_evicts_oldest_inactive() {
        let registry = SessionRegistry::new(test_config());
        for i in 0..4 {
            registry.create(Some(format!("s{}", i)), None);
        }
        registry.backdate("s2", 1000);

        registry.create(Some("s4".to_string()), None);

        assert_eq!(registry.count(), 4);
        assert!(registry.get("s2").is_none());
        assert!(registry.get("s4").is_some());
    }

    #[test]
    fn test_history_respects_limit() {
        let registry = SessionRegistry::new(test_config());
        registry.create(Some("s1".to_string()), None);

        for i in 0..5 {
            registry
                .push_history("s1", format!("https://a.test/{}", i))
                .unwrap();
        }

        let session = registry.get("s1").unwrap();
        assert_eq!(session.history.len(), 3);
        assert_eq!(session.history[0], "https://a.test/2");
    }

    #[test]
    fn test_update_missing_session_errors() {
        let registry = SessionRegistry::new(test_config());
        let err = registry.push_history("ghost", "https://a.test/".to_string());
        assert!(matches!(err, Err(GatehouseError::SessionNotFound(_))));
    }

    #[test]
    fn test_update_device_flags_mobile() {
        let registry = SessionRegistry::new(test_config());
        registry.create(Some("s1".to_string()), None);

        registry
            .update_device(
                "s1",
                DeviceInfo {
                    user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0)".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let session = registry.get("s1").unwrap();
        assert_eq!(session.metadata.get("is_mobile").unwrap(), "true");
        assert!(session.device_info.is_some());
    }

    #[test]
    fn test_stats_counts() {
        let registry = SessionRegistry::new(test_config());
        registry.create(Some("s1".to_string()), None);
        registry.create(Some("s2".to_string()), None);

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 2);
    }
}
