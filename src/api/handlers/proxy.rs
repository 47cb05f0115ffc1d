//! Proxied-content endpoint
//!
//! Decodes the target, routes the fetch through the session's sticky
//! egress, rewrites HTML/CSS, and passes other content through with
//! normalized headers. Failures render a self-consistent error document
//! (or JSON for API-shaped callers) and never surface as raw errors.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::api::server::AppState;
use crate::error::GatehouseError;
use crate::fetch::{ContentClass, FetchResponse};
use crate::models::Session;
use crate::pool::ResourceClass;
use crate::rewrite::decode_proxy_target;

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    /// Base64url-encoded (or plain absolute) target URL
    pub url: String,
    /// Session identifier; falls back to the X-Session-ID header
    pub session: Option<String>,
}

pub async fn proxy_get(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Response {
    handle_proxy(state, addr, query, headers, Method::GET, None).await
}

pub async fn proxy_post(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_proxy(state, addr, query, headers, Method::POST, Some(body)).await
}

#[instrument(skip_all, fields(method = %method))]
async fn handle_proxy(
    state: AppState,
    addr: SocketAddr,
    query: ProxyQuery,
    headers: HeaderMap,
    method: Method,
    body: Option<Bytes>,
) -> Response {
    let wants_json = accepts_json(&headers);

    let target = match decode_proxy_target(&query.url) {
        Ok(url) => url,
        Err(e) => return error_response(e, &query.url, wants_json),
    };

    // Resolve or create the session, then pin its egress identity.
    let session_id = query
        .session
        .clone()
        .or_else(|| header_value(&headers, "x-session-id"))
        .unwrap_or_default();
    let session = state.registry.create(
        (!session_id.is_empty()).then_some(session_id),
        Some(addr.ip().to_string()),
    );
    let token = state.binder.resolve(&session.id);
    state.registry.set_upstream_token(&session.id, token);

    let mut extra_headers = HashMap::new();
    if let Some(cookie) = header_value(&headers, "cookie") {
        extra_headers.insert("cookie".to_string(), cookie);
    }

    let fetched = state
        .fetcher
        .fetch(
            &session.id,
            resource_class(&session),
            method,
            target.clone(),
            &extra_headers,
            body,
        )
        .await;

    let fetched = match fetched {
        Ok(fetched) => fetched,
        Err(e) => return error_response(e, target.as_str(), wants_json),
    };

    match fetched.content_class() {
        ContentClass::Html => {
            let _ = state
                .registry
                .push_history(&session.id, target.to_string());
            respond_html(&state, fetched)
        }
        ContentClass::Css => respond_css(&state, fetched),
        class => respond_passthrough(fetched, class),
    }
}

fn respond_html(state: &AppState, fetched: FetchResponse) -> Response {
    let html = fetched.body_text();

    // A rewrite failure falls back to the unrewritten body rather than
    // failing the whole request.
    let rewritten = match state.rewriter.rewrite_html(&html, &fetched.final_url) {
        Ok(rewritten) => rewritten,
        Err(e) => {
            warn!("HTML rewrite failed for {}: {}", fetched.final_url, e);
            html.into_owned()
        }
    };

    let mut response = Response::builder()
        .status(mirror_status(fetched.status))
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(rewritten))
        .unwrap();
    add_permissive_cors(response.headers_mut());
    response
}

fn respond_css(state: &AppState, fetched: FetchResponse) -> Response {
    let rewritten = state
        .rewriter
        .rewrite_css(&fetched.body_text(), &fetched.final_url);

    let mut response = Response::builder()
        .status(mirror_status(fetched.status))
        .header(header::CONTENT_TYPE, "text/css; charset=utf-8")
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .body(Body::from(rewritten))
        .unwrap();
    add_permissive_cors(response.headers_mut());
    response
}

fn respond_passthrough(fetched: FetchResponse, class: ContentClass) -> Response {
    let mut builder = Response::builder().status(mirror_status(fetched.status));

    let headers = builder.headers_mut().unwrap();
    copy_passthrough_headers(&fetched.headers, headers);
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(match class {
            // Static assets may be cached; API-shaped payloads must not be.
            ContentClass::Binary => "public, max-age=3600",
            _ => "no-store",
        }),
    );
    add_permissive_cors(headers);

    builder.body(Body::from(fetched.body)).unwrap()
}

/// Upstream statuses are mirrored; anything unrepresentable maps to 502
fn mirror_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Copy safe upstream headers, dropping hop-by-hop, CSP, and upstream CORS
fn copy_passthrough_headers(from: &HeaderMap, to: &mut HeaderMap) {
    const COPIED: &[header::HeaderName] = &[
        header::CONTENT_TYPE,
        header::CONTENT_DISPOSITION,
        header::LAST_MODIFIED,
        header::ETAG,
    ];

    for name in COPIED {
        if let Some(value) = from.get(name) {
            to.insert(name.clone(), value.clone());
        }
    }
}

fn add_permissive_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
}

fn resource_class(session: &Session) -> ResourceClass {
    if session.prefers_mobile() {
        ResourceClass::Mobile
    } else {
        ResourceClass::Desktop
    }
}

fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/json") && !accept.contains("text/html"))
        .unwrap_or(false)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Render a failure as JSON or a minimal error document, without leaking
/// credentials or internals
fn error_response(error: GatehouseError, url: &str, wants_json: bool) -> Response {
    let status = error.status_code();

    if wants_json {
        let body = serde_json::json!({
            "error": error.to_string(),
            "kind": error.kind(),
            "url": url,
        });
        return Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
    }

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(error_page(&error, url)))
        .unwrap()
}

/// Minimal self-consistent error document shown in place of the page
pub fn error_page(error: &GatehouseError, url: &str) -> String {
    let title = match error {
        GatehouseError::UpstreamTimeout => "Request Timeout",
        GatehouseError::ResourceExhausted => "Gateway Busy",
        GatehouseError::SessionNotFound(_) => "Session Not Found",
        GatehouseError::InvalidTargetUrl(_) | GatehouseError::InvalidRequest(_) => "Bad Request",
        _ => "Error Loading Page",
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{title}</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; }}
        .error {{ color: #d32f2f; }}
        .url {{ color: #555; word-break: break-all; }}
    </style>
</head>
<body>
    <h1 class="error">{title}</h1>
    <p>{message}</p>
    <p class="url">{url}</p>
    <a href="javascript:history.back()">Go Back</a>
</body>
</html>
"#,
        title = title,
        message = html_escape(&error.to_string()),
        url = html_escape(url),
    )
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
