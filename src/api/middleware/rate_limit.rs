//! Admission control for every inbound operation
//!
//! Per client identity: a 60-second sliding window of request timestamps
//! plus a 5-second burst window. Any rejection starts a 60-second block
//! during which requests are refused unconditionally with the exact
//! remaining seconds. A periodic sweep bounds memory.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use dashmap::DashMap;

use crate::api::server::AppState;
use crate::error::GatehouseError;

const WINDOW: Duration = Duration::from_secs(60);
const BURST_WINDOW: Duration = Duration::from_secs(5);
const BLOCK_DURATION: Duration = Duration::from_secs(60);

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { limit: u32, remaining: u32 },
    Rejected { retry_after: u64 },
}

#[derive(Debug, Default)]
struct ClientRecord {
    /// Request timestamps within the last 60 seconds, oldest first
    window: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Sliding-window rate limiter keyed by client identity
#[derive(Clone)]
pub struct RateLimiter {
    enabled: bool,
    requests_per_minute: u32,
    burst_size: u32,
    clients: Arc<DashMap<String, ClientRecord>>,
}

impl RateLimiter {
    pub fn new(enabled: bool, requests_per_minute: u32, burst_size: u32) -> Self {
        Self {
            enabled,
            requests_per_minute: requests_per_minute.max(1),
            burst_size: burst_size.max(1),
            clients: Arc::new(DashMap::new()),
        }
    }

    /// Create a disabled rate limiter
    pub fn disabled() -> Self {
        Self::new(false, 100, 20)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self) -> u32 {
        self.requests_per_minute
    }

    /// Check whether a request from the given identity is admitted
    pub fn admit(&self, client_id: &str) -> Admission {
        self.admit_at(client_id, Instant::now())
    }

    fn admit_at(&self, client_id: &str, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Allowed {
                limit: self.requests_per_minute,
                remaining: self.requests_per_minute,
            };
        }

        // The entry lock makes the purge/count/append sequence atomic per
        // client identity.
        let mut record = self.clients.entry(client_id.to_string()).or_default();

        // A blocked client is refused without re-evaluating the windows.
        if let Some(until) = record.blocked_until {
            if now < until {
                let retry_after = (until - now).as_secs().max(1);
                debug!("Client {} blocked for {}s more", client_id, retry_after);
                return Admission::Rejected { retry_after };
            }
            record.blocked_until = None;
        }

        while let Some(&oldest) = record.window.front() {
            if now.duration_since(oldest) > WINDOW {
                record.window.pop_front();
            } else {
                break;
            }
        }

        let burst_count = record
            .window
            .iter()
            .rev()
            .take_while(|&&ts| now.duration_since(ts) <= BURST_WINDOW)
            .count();

        if burst_count >= self.burst_size as usize
            || record.window.len() >= self.requests_per_minute as usize
        {
            record.blocked_until = Some(now + BLOCK_DURATION);
            warn!("Rate limit exceeded for {}", client_id);
            return Admission::Rejected {
                retry_after: BLOCK_DURATION.as_secs(),
            };
        }

        record.window.push_back(now);
        Admission::Allowed {
            limit: self.requests_per_minute,
            remaining: self.requests_per_minute - record.window.len() as u32,
        }
    }

    /// Drop identities with empty windows and expired blocks. Returns the
    /// number of records removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.clients.len();

        self.clients.retain(|_, record| {
            record
                .window
                .retain(|&ts| now.duration_since(ts) <= WINDOW);
            let blocked = record
                .blocked_until
                .map(|until| now < until)
                .unwrap_or(false);
            blocked || !record.window.is_empty()
        });

        let removed = before - self.clients.len();
        if removed > 0 {
            debug!("Rate limiter pruned {} idle identities", removed);
        }
        removed
    }

    /// Number of tracked client identities
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// Axum middleware gating the whole router behind the rate limiter
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = client_identity(&request);

    match state.limiter.admit(&identity) {
        Admission::Allowed { limit, remaining } => {
            let mut response = next.run(request).await;
            apply_quota_headers(response.headers_mut(), limit, remaining);
            response
        }
        Admission::Rejected { retry_after } => {
            let mut response =
                GatehouseError::AdmissionRejected { retry_after }.into_response();
            apply_quota_headers(response.headers_mut(), state.limiter.limit(), 0);
            response
        }
    }
}

fn apply_quota_headers(headers: &mut http::HeaderMap, limit: u32, remaining: u32) {
    let reset = chrono::Utc::now().timestamp() + WINDOW.as_secs() as i64;
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&reset.to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
}

/// Resolve the client identity: session header, session cookie, then the
/// peer address
fn client_identity(request: &Request) -> String {
    if let Some(session) = request
        .headers()
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        return format!("session:{}", session);
    }

    if let Some(cookie) = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
    {
        for pair in cookie.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == "session_id" && !value.is_empty() {
                    return format!("session:{}", value);
                }
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| format!("ip:{}", info.0.ip()))
        .unwrap_or_else(|| "ip:unknown".to_string())
}
