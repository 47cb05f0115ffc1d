//! WebSocket connection hub
//!
//! Each connection is owned by one session. Commands are processed in
//! strict receipt order inside the receive loop; results and heartbeats
//! are pushed through a bounded per-connection queue. Disconnects always
//! release the session's pooled resource and end the session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::WS_BUFFER_SIZE;
use crate::api::handlers::proxy::error_page;
use crate::api::server::AppState;
use crate::error::Result;
use crate::fetch::ContentClass;
use crate::models::{ClientCommand, ServerEvent};
use crate::pool::{ResourceClass, ResourceFactory, ResourcePool};
use crate::rewrite::decode_proxy_target;
use crate::session::SessionRegistry;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct ConnectionEntry {
    tx: mpsc::Sender<ServerEvent>,
    last_seen_ms: Arc<AtomicU64>,
}

/// Registry of open duplex connections, keyed by session id
pub struct ConnectionHub {
    connections: DashMap<String, ConnectionEntry>,
    heartbeat_interval: u64,
    heartbeat_timeout: u64,
}

impl ConnectionHub {
    pub fn new(heartbeat_interval: u64, heartbeat_timeout: u64) -> Self {
        Self {
            connections: DashMap::new(),
            heartbeat_interval: heartbeat_interval.max(1),
            heartbeat_timeout: heartbeat_timeout.max(1),
        }
    }

    fn register(&self, session_id: &str, tx: mpsc::Sender<ServerEvent>) {
        self.connections.insert(
            session_id.to_string(),
            ConnectionEntry {
                tx,
                last_seen_ms: Arc::new(AtomicU64::new(now_ms())),
            },
        );
        info!(
            "Connection registered for session {} ({} open)",
            session_id,
            self.connections.len()
        );
    }

    fn unregister(&self, session_id: &str) -> bool {
        let removed = self.connections.remove(session_id).is_some();
        if removed {
            info!(
                "Connection removed for session {} ({} open)",
                session_id,
                self.connections.len()
            );
        }
        removed
    }

    /// Record client liveness for a session
    pub fn touch(&self, session_id: &str) {
        if let Some(entry) = self.connections.get(session_id) {
            entry.last_seen_ms.store(now_ms(), Ordering::Relaxed);
        }
    }

    /// Push an event to a session's connection; a full buffer drops it
    pub fn send_to(&self, session_id: &str, event: ServerEvent) -> bool {
        match self.connections.get(session_id) {
            Some(entry) => match entry.tx.try_send(event) {
                Ok(()) => true,
                Err(_) => {
                    debug!("Outbound buffer full for session {}, dropping push", session_id);
                    false
                }
            },
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sessions whose connection has not acknowledged within the timeout
    fn stale_sessions(&self, now_ms: u64) -> Vec<String> {
        let timeout_ms = self.heartbeat_timeout * 1000;
        self.connections
            .iter()
            .filter(|entry| {
                now_ms.saturating_sub(entry.last_seen_ms.load(Ordering::Relaxed)) > timeout_ms
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Push periodic heartbeats and force-close unresponsive connections,
    /// releasing their pooled resources and ending their sessions
    #[instrument(skip_all)]
    pub async fn run_heartbeat<F: ResourceFactory>(
        &self,
        registry: Arc<SessionRegistry>,
        pool: Arc<ResourcePool<F>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "Starting heartbeat service (interval: {}s, timeout: {}s)",
            self.heartbeat_interval, self.heartbeat_timeout
        );

        let mut tick = interval(Duration::from_secs(self.heartbeat_interval));
        tick.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for session_id in self.stale_sessions(now_ms()) {
                        warn!("Session {} missed the heartbeat ack window, closing", session_id);
                        // Dropping the sender closes the outbound pump and
                        // with it the socket.
                        self.unregister(&session_id);
                        pool.release(&session_id).await;
                        registry.end(&session_id);
                    }

                    let timestamp = chrono::Utc::now().to_rfc3339();
                    for entry in self.connections.iter() {
                        let _ = entry.tx.try_send(ServerEvent::Heartbeat {
                            timestamp: timestamp.clone(),
                        });
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat service shutting down");
                        break;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn backdate(&self, session_id: &str, seconds: u64) {
        if let Some(entry) = self.connections.get(session_id) {
            entry
                .last_seen_ms
                .store(now_ms().saturating_sub(seconds * 1000), Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Existing session to resume; a fresh one is created when absent
    pub session: Option<String>,
}

/// WebSocket endpoint for the duplex client channel
pub async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session_ws(socket, state, addr, query.session))
}

async fn handle_session_ws(
    socket: WebSocket,
    state: AppState,
    addr: SocketAddr,
    requested_session: Option<String>,
) {
    let session = state
        .registry
        .create(requested_session, Some(addr.ip().to_string()));
    let session_id = session.id.clone();

    let token = state.binder.resolve(&session_id);
    state.registry.set_upstream_token(&session_id, token);

    let (tx, mut rx) = mpsc::channel::<ServerEvent>(WS_BUFFER_SIZE);
    state.hub.register(&session_id, tx.clone());

    let spoof = &state.config.spoof;
    let init = ServerEvent::Init {
        session_id: session_id.clone(),
        config: json!({
            "country": state.config.upstream.country,
            "timezone": spoof.timezone,
            "language": spoof.language,
            "coordinates": {
                "latitude": spoof.latitude,
                "longitude": spoof.longitude,
            },
        }),
    };
    if tx.send(init).await.is_err() {
        state.hub.unregister(&session_id);
        return;
    }

    let (mut sink, mut stream) = socket.split();

    // Outbound pump: serialize queued events onto the socket. Ends when
    // the hub drops this connection's sender (forced close) or the socket
    // dies.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => {
                    if sink.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize outbound event: {}", e);
                }
            }
        }
    });

    // Inbound loop: commands dispatch inline so a session's commands are
    // processed strictly in receipt order.
    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        state.hub.touch(&session_id);
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(command) => {
                                dispatch_command(&state, &session_id, command, &tx).await
                            }
                            Err(e) => {
                                let _ = tx
                                    .send(ServerEvent::Error {
                                        message: format!("Unrecognized command: {}", e),
                                    })
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        state.hub.touch(&session_id)
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Session {} sent close", session_id);
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error for session {}: {}", session_id, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                    None => break,
                }
            }
            // The heartbeat service force-closed this connection.
            _ = &mut send_task => break,
        }
    }

    // Disconnect, normal or abnormal: always release the pooled resource
    // and end the session.
    state.hub.unregister(&session_id);
    state.fetcher.release(&session_id).await;
    state.binder.reset(&session_id);
    state.registry.end(&session_id);
    send_task.abort();

    info!("WebSocket disconnected for session {}", session_id);
}

async fn dispatch_command(
    state: &AppState,
    session_id: &str,
    command: ClientCommand,
    tx: &mpsc::Sender<ServerEvent>,
) {
    match command {
        ClientCommand::Navigate { url } => {
            let event = match resolve_navigation_target(&url, state.rewriter.gateway_base()) {
                Ok(target) => navigate(state, session_id, target).await,
                Err(e) => ServerEvent::PageContent {
                    content: error_page(&e, &url),
                    url,
                },
            };
            let _ = tx.send(event).await;
        }

        ClientCommand::HttpRequest {
            id,
            method,
            url,
            headers,
            body,
        } => {
            let event = http_request(state, session_id, id, method, url, headers, body).await;
            let _ = tx.send(event).await;
        }

        ClientCommand::DeviceInfo { payload } => {
            if let Err(e) = state.registry.update_device(session_id, payload) {
                warn!("Device info update failed for {}: {}", session_id, e);
            }
        }

        ClientCommand::Ping => {
            let _ = tx.send(ServerEvent::Pong).await;
        }
    }
}

async fn navigate(state: &AppState, session_id: &str, target: Url) -> ServerEvent {
    let class = session_class(state, session_id);

    let fetched = state
        .fetcher
        .fetch(
            session_id,
            class,
            Method::GET,
            target.clone(),
            &HashMap::new(),
            None,
        )
        .await;

    let fetched = match fetched {
        Ok(fetched) => fetched,
        Err(e) => {
            return ServerEvent::PageContent {
                url: target.to_string(),
                content: error_page(&e, target.as_str()),
            }
        }
    };

    let _ = state
        .registry
        .push_history(session_id, target.to_string());

    let content = match fetched.content_class() {
        ContentClass::Html => {
            let html = fetched.body_text();
            match state.rewriter.rewrite_html(&html, &fetched.final_url) {
                Ok(rewritten) => rewritten,
                Err(e) => {
                    warn!("HTML rewrite failed for {}: {}", fetched.final_url, e);
                    html.into_owned()
                }
            }
        }
        ContentClass::Binary => {
            "<html><body><p>Binary content cannot be displayed</p></body></html>".to_string()
        }
        _ => fetched.body_text().into_owned(),
    };

    ServerEvent::PageContent {
        url: target.to_string(),
        content,
    }
}

async fn http_request(
    state: &AppState,
    session_id: &str,
    id: String,
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: Option<String>,
) -> ServerEvent {
    let method = Method::from_bytes(method.as_bytes()).unwrap_or(Method::GET);

    let target = match Url::parse(&url) {
        Ok(target) => target,
        Err(e) => {
            return ServerEvent::HttpResponse {
                id,
                status: 400,
                headers: HashMap::new(),
                body: json!({ "error": e.to_string() }).to_string(),
            }
        }
    };

    let class = session_class(state, session_id);
    let result = state
        .fetcher
        .fetch(
            session_id,
            class,
            method,
            target,
            &headers,
            body.map(Bytes::from),
        )
        .await;

    match result {
        Ok(fetched) => {
            let headers = fetched
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.to_string(), v.to_string()))
                })
                .collect();

            ServerEvent::HttpResponse {
                id,
                status: fetched.status,
                headers,
                body: fetched.body_text().into_owned(),
            }
        }
        Err(e) => ServerEvent::HttpResponse {
            id,
            status: e.status_code().as_u16(),
            headers: HashMap::new(),
            body: json!({ "error": e.to_string(), "kind": e.kind() }).to_string(),
        },
    }
}

fn session_class(state: &AppState, session_id: &str) -> ResourceClass {
    state
        .registry
        .get(session_id)
        .filter(|session| session.prefers_mobile())
        .map(|_| ResourceClass::Mobile)
        .unwrap_or(ResourceClass::Desktop)
}

/// A navigate target may be a plain URL, an encoded target, or a link that
/// was already rewritten to gateway-relative form
fn resolve_navigation_target(raw: &str, gateway_base: &str) -> Result<Url> {
    if raw.starts_with(gateway_base) {
        if let Some(idx) = raw.find("url=") {
            let param = &raw[idx + 4..];
            let param = param.split('&').next().unwrap_or(param);
            return decode_proxy_target(param);
        }
    }
    decode_proxy_target(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::encode_proxy_url;

    #[tokio::test]
    async fn test_hub_register_send_unregister() {
        let hub = ConnectionHub::new(30, 120);
        let (tx, mut rx) = mpsc::channel(4);

        hub.register("s1", tx);
        assert_eq!(hub.connection_count(), 1);

        assert!(hub.send_to("s1", ServerEvent::Pong));
        assert!(matches!(rx.recv().await, Some(ServerEvent::Pong)));

        assert!(!hub.send_to("missing", ServerEvent::Pong));

        assert!(hub.unregister("s1"));
        assert!(!hub.unregister("s1"));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_hub_full_buffer_drops_push() {
        let hub = ConnectionHub::new(30, 120);
        let (tx, _rx) = mpsc::channel(1);
        hub.register("s1", tx);

        assert!(hub.send_to("s1", ServerEvent::Pong));
        // Buffer of one is now full; the push is dropped, not blocked.
        assert!(!hub.send_to("s1", ServerEvent::Pong));
    }

    #[tokio::test]
    async fn test_stale_sessions_detected_by_ack_age() {
        let hub = ConnectionHub::new(30, 120);
        let (tx, _rx) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        hub.register("fresh", tx);
        hub.register("stale", tx2);
        hub.backdate("stale", 300);

        let stale = hub.stale_sessions(now_ms());
        assert_eq!(stale, vec!["stale".to_string()]);

        // A touch revives the connection.
        hub.touch("stale");
        assert!(hub.stale_sessions(now_ms()).is_empty());
    }

    #[test]
    fn test_resolve_navigation_target_plain_url() {
        let target = resolve_navigation_target("https://a.test/page", "/proxy").unwrap();
        assert_eq!(target.as_str(), "https://a.test/page");
    }

    #[test]
    fn test_resolve_navigation_target_unwraps_gateway_link() {
        let original = Url::parse("https://a.test/page?x=1").unwrap();
        let wrapped = encode_proxy_url(&original, "/proxy");

        let target = resolve_navigation_target(&wrapped, "/proxy").unwrap();
        assert_eq!(target.as_str(), "https://a.test/page?x=1");
    }

    #[test]
    fn test_resolve_navigation_target_rejects_garbage() {
        assert!(resolve_navigation_target("not a url at all", "/proxy").is_err());
    }
}
