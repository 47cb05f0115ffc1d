//! Outbound fetch through the sticky upstream egress
//!
//! Pooled `reqwest` clients carry a swappable proxy slot so a recycled
//! client exits through the identity of its current owning session. The
//! fetcher adds a browser-like header set, follows redirects, retries once
//! without compression when a payload cannot be decoded, and converts every
//! upstream failure into a structured error.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::HeaderMap;
use reqwest::{redirect, Method};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::SpoofConfig;
use crate::error::{GatehouseError, Result};
use crate::pool::{ResourceClass, ResourceFactory, ResourcePool};
use crate::upstream::StickySessionBinder;

const MAX_REDIRECTS: usize = 10;
/// Bytes of a text body inspected by the garble heuristic
const GARBLE_PROBE_LEN: usize = 512;

const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Mobile/15E148 Safari/604.1";

/// Broad classification of a fetched payload, drives rewrite vs passthrough
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Html,
    Css,
    JavaScript,
    Json,
    Text,
    Binary,
}

impl ContentClass {
    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_lowercase();
        if ct.contains("text/html") || ct.contains("application/xhtml") {
            ContentClass::Html
        } else if ct.contains("text/css") {
            ContentClass::Css
        } else if ct.contains("javascript") || ct.contains("ecmascript") {
            ContentClass::JavaScript
        } else if ct.contains("json") {
            ContentClass::Json
        } else if ct.starts_with("text/") || ct.contains("xml") {
            ContentClass::Text
        } else {
            ContentClass::Binary
        }
    }

    /// Whether the garble heuristic applies to this class
    fn is_textual(&self) -> bool {
        !matches!(self, ContentClass::Binary)
    }
}

/// Result of an outbound fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub content_type: String,
    pub body: Bytes,
    pub final_url: Url,
}

impl FetchResponse {
    pub fn content_class(&self) -> ContentClass {
        ContentClass::from_content_type(&self.content_type)
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Pooled outbound client bound to an upstream egress identity
pub struct HttpHandle {
    client: reqwest::Client,
    class: ResourceClass,
    /// Proxy URL (with composed auth) for the current owning session.
    /// `None` routes directly, used when no upstream is configured and
    /// after release.
    proxy_slot: Arc<RwLock<Option<Url>>>,
}

impl HttpHandle {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn class(&self) -> ResourceClass {
        self.class
    }

    fn set_proxy(&self, target: Option<Url>) {
        if let Ok(mut slot) = self.proxy_slot.write() {
            *slot = target;
        }
    }

    #[cfg(test)]
    fn current_proxy(&self) -> Option<Url> {
        self.proxy_slot.read().ok().and_then(|slot| slot.clone())
    }
}

/// Builds pooled `reqwest` clients with the session's egress identity and
/// device-class profile
pub struct ClientFactory {
    binder: Arc<StickySessionBinder>,
    spoof: SpoofConfig,
    request_timeout: Duration,
}

impl ClientFactory {
    pub fn new(binder: Arc<StickySessionBinder>, spoof: SpoofConfig, request_timeout: u64) -> Self {
        Self {
            binder,
            spoof,
            request_timeout: Duration::from_secs(request_timeout),
        }
    }

    fn proxy_target(&self, session_id: &str) -> Option<Url> {
        let raw = self.binder.proxy_url(session_id)?;
        match Url::parse(&raw) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Composed upstream proxy URL did not parse: {}", e);
                None
            }
        }
    }

    fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        if let Ok(value) = HeaderValue::from_str(&format!("{},en;q=0.9", self.spoof.language)) {
            headers.insert(header::ACCEPT_LANGUAGE, value);
        }
        headers.insert(HeaderName::from_static("dnt"), HeaderValue::from_static("1"));
        headers.insert(
            header::UPGRADE_INSECURE_REQUESTS,
            HeaderValue::from_static("1"),
        );
        // Accept-Encoding is managed by the client and limited to the
        // schemes it can actually decode (gzip, deflate).
        headers
    }
}

#[async_trait::async_trait]
impl ResourceFactory for ClientFactory {
    type Handle = HttpHandle;

    async fn create(&self, session_id: &str, class: ResourceClass) -> Result<HttpHandle> {
        let proxy_slot = Arc::new(RwLock::new(self.proxy_target(session_id)));

        let slot = proxy_slot.clone();
        let client = reqwest::Client::builder()
            .user_agent(match class {
                ResourceClass::Desktop => DESKTOP_USER_AGENT,
                ResourceClass::Mobile => MOBILE_USER_AGENT,
            })
            .default_headers(self.default_headers())
            .timeout(self.request_timeout)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            // Commercial egress pools terminate TLS with provider certs.
            .danger_accept_invalid_certs(true)
            .proxy(reqwest::Proxy::custom(move |_| {
                slot.read().ok().and_then(|target| target.clone())
            }))
            .build()?;

        debug!(
            "Created {} outbound client for session {}",
            class.as_str(),
            session_id
        );

        Ok(HttpHandle {
            client,
            class,
            proxy_slot,
        })
    }

    async fn bind(&self, handle: &HttpHandle, session_id: &str) {
        handle.set_proxy(self.proxy_target(session_id));
    }

    async fn reset(&self, handle: &HttpHandle) {
        // A free client must not keep exiting through the previous owner's
        // sticky identity.
        handle.set_proxy(None);
    }

    async fn destroy(&self, _handle: &HttpHandle) {
        // Dropping the client closes its connection pool.
    }
}

/// Performs outbound requests using pool-acquired clients
pub struct Fetcher {
    pool: Arc<ResourcePool<ClientFactory>>,
}

impl Fetcher {
    pub fn new(pool: Arc<ResourcePool<ClientFactory>>) -> Self {
        Self { pool }
    }

    /// Fetch a URL on behalf of a session. Upstream failures come back as
    /// structured errors; non-2xx statuses are returned as responses so the
    /// caller can mirror them.
    #[instrument(skip(self, extra_headers, body), fields(session = session_id, url = %url))]
    pub async fn fetch(
        &self,
        session_id: &str,
        class: ResourceClass,
        method: Method,
        url: Url,
        extra_headers: &HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Result<FetchResponse> {
        let handle = self.pool.acquire(session_id, class).await?;

        let result = self
            .send(&handle, method, url, extra_headers, body)
            .await;

        if result.is_err() {
            // Recycle the client so a wedged connection is not pinned to
            // the session; the next fetch acquires a fresh binding.
            self.pool.release(session_id).await;
        }

        result
    }

    async fn send(
        &self,
        handle: &HttpHandle,
        method: Method,
        url: Url,
        extra_headers: &HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Result<FetchResponse> {
        match self
            .send_once(handle, &method, &url, extra_headers, body.clone(), false)
            .await
        {
            Err(GatehouseError::UndecodableContent(cause)) => {
                debug!(
                    "Undecodable payload from {} ({}), retrying without compression",
                    url, cause
                );
                self.send_once(handle, &method, &url, extra_headers, body, true)
                    .await
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        handle: &HttpHandle,
        method: &Method,
        url: &Url,
        extra_headers: &HashMap<String, String>,
        body: Option<Bytes>,
        identity_encoding: bool,
    ) -> Result<FetchResponse> {
        let mut request = handle.client().request(method.clone(), url.clone());

        request = request.header(header::REFERER, url.as_str());
        if let Some(origin) = origin_of(url) {
            request = request.header(header::ORIGIN, origin);
        }
        if identity_encoding {
            request = request.header(header::ACCEPT_ENCODING, "identity");
        }

        for (name, value) in extra_headers {
            if is_hop_by_hop_header(name) || is_managed_header(name) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    request = request.header(name, value);
                }
                _ => debug!("Skipping unforwardable header: {}", name),
            }
        }

        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(GatehouseError::from)?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let body = response.bytes().await.map_err(GatehouseError::from)?;

        if looks_garbled(&content_type, &body) {
            return Err(GatehouseError::UndecodableContent(format!(
                "{} returned a corrupted text payload",
                final_url
            )));
        }

        Ok(FetchResponse {
            status,
            headers,
            content_type,
            body,
            final_url,
        })
    }

    /// Release the session's pooled client
    pub async fn release(&self, session_id: &str) {
        self.pool.release(session_id).await;
    }
}

/// Scheme://host[:port] origin of a URL, if it has a host
fn origin_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Some(format!("{}://{}", url.scheme(), host)),
    }
}

/// Heuristic detection of a text payload that survived transfer-decoding as
/// garbage (typically compression the runtime could not undo): the probe
/// prefix is not valid UTF-8 and is dominated by non-ASCII bytes.
fn looks_garbled(content_type: &str, body: &[u8]) -> bool {
    if body.is_empty() || !ContentClass::from_content_type(content_type).is_textual() {
        return false;
    }

    let probe = &body[..body.len().min(GARBLE_PROBE_LEN)];
    match std::str::from_utf8(probe) {
        Ok(_) => false,
        // A multi-byte character cut by the probe boundary is not garbage.
        Err(e) if e.error_len().is_none() && probe.len() - e.valid_up_to() < 4 => false,
        Err(_) => {
            let suspicious = probe
                .iter()
                .filter(|&&b| b >= 0x80 || (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r')))
                .count();
            suspicious * 10 > probe.len() * 3
        }
    }
}

/// Hop-by-hop headers that must not be forwarded upstream
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers the outbound client composes itself
fn is_managed_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "host" | "content-length" | "accept-encoding"
    )
}
